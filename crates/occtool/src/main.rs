use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use occtool_core::bulk::{self, BulkImportOptions};
use occtool_core::config::{Settings, load_project_config};
use occtool_core::deploy::{self, RunOptions};
use occtool_core::extension::{self, ExtensionContext, ExtensionKind};
use occtool_core::files;
use occtool_core::manifest::{self, ClassifierRules, GenerateOptions, GitChangedFiles};
use occtool_core::page_tags::{self, PageTagArea, PageTagOptions, ScriptType, SiteResponse};
use occtool_core::publish;
use occtool_core::request::{JobPolling, OccClient};
use occtool_core::runtime::{PathOverrides, ResolutionContext, ResolvedPaths, resolve_paths};
use occtool_core::sites::resolve_site_ids;
use occtool_core::theme;
use occtool_core::widget::{self, UploadOptions, VersionInfo, WidgetFile};
use occtool_core::widget_backup;
use occtool_core::widget_restore;
use occtool_core::worksets::{self, WorksetLookup, WorksetLookupKind};

#[derive(Debug, Parser)]
#[command(
    name = "occtool",
    version,
    about = "Deployment and admin automation for OCC storefront projects"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    temp_dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log at debug level")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    config: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            temp_dir: cli.temp_dir.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Worksets(WorksetsArgs),
    #[command(name = "page-tags")]
    PageTags(PageTagsArgs),
    Bulk(BulkArgs),
    Deploy(DeployArgs),
    #[command(about = "Publish the current user's workset")]
    Publish,
    Files(FilesArgs),
    Extension(ExtensionArgs),
    Widget(WidgetArgs),
    Theme(ThemeArgs),
    Sse(SseArgs),
}

#[derive(Debug, Args)]
struct WorksetsArgs {
    #[command(subcommand)]
    command: WorksetsSubcommand,
}

#[derive(Debug, Args)]
struct LookupArgs {
    #[arg(long = "type", default_value = "name", help = "Lookup by id or name")]
    kind: String,
    value: String,
}

impl LookupArgs {
    fn lookup(&self) -> Result<WorksetLookup> {
        Ok(WorksetLookup {
            kind: WorksetLookupKind::parse(&self.kind)?,
            value: self.value.clone(),
        })
    }
}

#[derive(Debug, Subcommand)]
enum WorksetsSubcommand {
    List {
        #[arg(long, help = "SCIM query")]
        query: Option<String>,
        #[arg(long, help = "Fetch details for each workset")]
        details: bool,
    },
    Create {
        name: String,
    },
    Delete(LookupArgs),
    Update {
        #[command(flatten)]
        lookup: LookupArgs,
        #[arg(long, value_name = "NAME")]
        name: String,
    },
}

#[derive(Debug, Args)]
struct PageTagsArgs {
    #[command(subcommand)]
    command: PageTagsSubcommand,
}

#[derive(Debug, Args)]
struct SiteArgs {
    #[arg(long, value_name = "IDS", help = "Comma-separated site ids (default: all sites)")]
    sites: Option<String>,
}

#[derive(Debug, Args)]
struct TagArgs {
    #[arg(long, help = "Storefront-relative file or glob")]
    file: String,
    #[arg(long, help = "head, body-start or body-end (default: from the file path)")]
    area: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long = "type", default_value = "file", help = "file or content")]
    script_type: String,
    #[arg(long)]
    order: Option<String>,
    #[arg(long, help = "Create the tag disabled")]
    disabled: bool,
    #[arg(long, help = "Skip the asset version on the script src")]
    no_version: bool,
    #[command(flatten)]
    sites: SiteArgs,
}

impl TagArgs {
    fn options(&self, tag_id: Option<String>) -> Result<PageTagOptions> {
        Ok(PageTagOptions {
            area: self.area.as_deref().map(PageTagArea::parse).transpose()?,
            file: self.file.clone(),
            name: self.name.clone(),
            script_type: ScriptType::parse(&self.script_type)?,
            order: self.order.clone(),
            enabled: !self.disabled,
            append_version: !self.no_version,
            tag_id,
        })
    }
}

#[derive(Debug, Subcommand)]
enum PageTagsSubcommand {
    List {
        #[arg(long)]
        area: String,
        #[arg(long, help = "SCIM query")]
        query: Option<String>,
        #[arg(long)]
        tag_id: Option<String>,
        #[command(flatten)]
        sites: SiteArgs,
    },
    Create(TagArgs),
    Update {
        #[command(flatten)]
        tag: TagArgs,
        #[arg(long)]
        tag_id: Option<String>,
        #[arg(long, help = "SCIM query selecting tags to update")]
        query: Option<String>,
    },
    Delete {
        #[arg(long)]
        area: String,
        #[arg(long)]
        tag_id: Option<String>,
        #[arg(long, help = "SCIM query selecting tags to delete")]
        query: Option<String>,
        #[command(flatten)]
        sites: SiteArgs,
    },
}

#[derive(Debug, Args)]
struct BulkArgs {
    #[command(subcommand)]
    command: BulkSubcommand,
}

#[derive(Debug, Subcommand)]
enum BulkSubcommand {
    Import {
        #[arg(long, help = "Import operation id, e.g. Products")]
        id: String,
        file: PathBuf,
        #[arg(long, default_value = "json")]
        format: String,
        #[arg(long, default_value = "add")]
        mode: String,
    },
}

#[derive(Debug, Args)]
struct DeployArgs {
    #[command(subcommand)]
    command: DeploySubcommand,
}

#[derive(Debug, Subcommand)]
enum DeploySubcommand {
    Generate {
        #[arg(long, help = "Git revision the diff starts from")]
        revision: String,
        #[arg(long, default_value = "HEAD")]
        head: String,
        #[arg(long, default_value = "deploy.json")]
        output: PathBuf,
        #[arg(long, help = "Append a publish step")]
        publish: bool,
    },
    Run {
        #[arg(default_value = "deploy.json")]
        manifest: PathBuf,
        #[arg(long, help = "Skip restoring widgets from backup when an upgrade fails")]
        no_restore: bool,
        #[command(flatten)]
        sites: SiteArgs,
    },
}

#[derive(Debug, Args)]
struct FilesArgs {
    #[command(subcommand)]
    command: FilesSubcommand,
}

#[derive(Debug, Subcommand)]
enum FilesSubcommand {
    Upload {
        #[arg(help = "Glob relative to the storefront root")]
        pattern: String,
        #[arg(long, help = "Remote settings folder")]
        folder: Option<String>,
    },
}

#[derive(Debug, Args)]
struct ExtensionArgs {
    #[command(subcommand)]
    command: ExtensionSubcommand,
}

#[derive(Debug, Subcommand)]
enum ExtensionSubcommand {
    Upload {
        #[arg(long = "type", default_value = "widget")]
        kind: String,
        name: String,
    },
    Upgrade {
        #[arg(long = "type", default_value = "widget")]
        kind: String,
        #[arg(required = true)]
        names: Vec<String>,
        #[arg(long, help = "Skip restoring widgets from backup on failure")]
        no_restore: bool,
    },
}

#[derive(Debug, Args)]
struct WidgetArgs {
    #[command(subcommand)]
    command: WidgetSubcommand,
}

#[derive(Debug, Subcommand)]
enum WidgetSubcommand {
    Backup { name: String },
    Restore { name: String, file: PathBuf },
    #[command(about = "Upload template, LESS, locales and JavaScript of a widget")]
    Upload {
        name: String,
        #[arg(long, value_delimiter = ',', help = "Subset of js,less,template,locales")]
        files: Vec<String>,
        #[arg(long = "js", value_delimiter = ',', help = "Single JavaScript files to push")]
        js_files: Vec<String>,
        #[arg(long, help = "Skip the backup taken before uploading")]
        no_backup: bool,
        #[arg(long, help = "Skip restoring the widget from backup on failure")]
        no_restore: bool,
    },
}

#[derive(Debug, Args)]
struct ThemeArgs {
    #[command(subcommand)]
    command: ThemeSubcommand,
}

#[derive(Debug, Subcommand)]
enum ThemeSubcommand {
    #[command(about = "Concatenate the storefront LESS and push it to the configured theme")]
    Generate,
}

#[derive(Debug, Args)]
struct SseArgs {
    #[command(subcommand)]
    command: SseSubcommand,
}

#[derive(Debug, Subcommand)]
enum SseSubcommand {
    Upload {
        #[arg(help = "Extensions to upload (default: every local one)")]
        names: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        skip: Vec<String>,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    let Some(command) = cli.command else {
        let mut command = Cli::command();
        command.print_help()?;
        println!();
        return Ok(());
    };

    let session = Session::open(&runtime)?;
    match command {
        Commands::Worksets(WorksetsArgs { command }) => run_worksets(&session, command),
        Commands::PageTags(PageTagsArgs { command }) => run_page_tags(&session, command),
        Commands::Bulk(BulkArgs { command }) => run_bulk(&session, command),
        Commands::Deploy(DeployArgs { command }) => run_deploy(&session, command),
        Commands::Publish => run_publish(&session),
        Commands::Files(FilesArgs { command }) => run_files(&session, command),
        Commands::Extension(ExtensionArgs { command }) => run_extension(&session, command),
        Commands::Widget(WidgetArgs { command }) => run_widget(&session, command),
        Commands::Theme(ThemeArgs { command }) => run_theme(&session, command),
        Commands::Sse(SseArgs { command }) => run_sse(&session, command),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("OCCTOOL_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

struct Session {
    paths: ResolvedPaths,
    settings: Settings,
    client: OccClient,
}

impl Session {
    fn open(runtime: &RuntimeOptions) -> Result<Self> {
        let paths = resolve_runtime_paths(runtime)?;
        if runtime.diagnostics {
            println!("[diagnostics]\n{}\n", paths.diagnostics());
        }
        let config = load_project_config(&paths.config_path)?;
        let settings = Settings::from_project(&config, &paths.config_dir(), |key| {
            std::env::var(key).ok()
        })?;
        let client = OccClient::from_settings(&settings, &paths)?;
        Ok(Self {
            paths,
            settings,
            client,
        })
    }

    fn extension_context(&self) -> ExtensionContext<'_> {
        ExtensionContext::new(&self.settings, &self.paths)
    }
}

fn run_worksets(session: &Session, command: WorksetsSubcommand) -> Result<()> {
    let api = &session.client;
    match command {
        WorksetsSubcommand::List { query, details } => {
            let found = worksets::list(api, query.as_deref(), details)?;
            println!("worksets: {}", found.len());
            print_json(&found)
        }
        WorksetsSubcommand::Create { name } => {
            let report = worksets::create(api, &name)?;
            println!("already_created: {}", format_flag(report.already_created));
            print_json(&report.worksets)
        }
        WorksetsSubcommand::Delete(lookup) => {
            let report = worksets::delete(api, &lookup.lookup()?)?;
            print_list("deleted", &report.affected);
            Ok(())
        }
        WorksetsSubcommand::Update { lookup, name } => {
            let report = worksets::rename(api, &lookup.lookup()?, &name)?;
            print_list("renamed", &report.affected);
            Ok(())
        }
    }
}

fn run_page_tags(session: &Session, command: PageTagsSubcommand) -> Result<()> {
    let api = &session.client;
    let settings = &session.settings;
    match command {
        PageTagsSubcommand::List {
            area,
            query,
            tag_id,
            sites,
        } => {
            let area = PageTagArea::parse(&area)?;
            let site_ids = resolve_site_ids(api, sites.sites.as_deref())?;
            let responses = match tag_id {
                Some(tag_id) => page_tags::get(api, area, &site_ids, &tag_id)?,
                None => page_tags::list(api, area, &site_ids, query.as_deref())?,
            };
            print_site_responses(&responses)
        }
        PageTagsSubcommand::Create(tag) => {
            let site_ids = resolve_site_ids(api, tag.sites.sites.as_deref())?;
            let responses = page_tags::create(api, settings, &site_ids, &tag.options(None)?)?;
            print_site_responses(&responses)
        }
        PageTagsSubcommand::Update { tag, tag_id, query } => {
            if tag_id.is_none() && query.is_none() {
                bail!("You must provide the --tag-id=<id> or --query=<SCIM Query> for the update");
            }
            let site_ids = resolve_site_ids(api, tag.sites.sites.as_deref())?;
            let responses =
                page_tags::update(api, settings, &site_ids, &tag.options(tag_id)?, query.as_deref())?;
            print_site_responses(&responses)
        }
        PageTagsSubcommand::Delete {
            area,
            tag_id,
            query,
            sites,
        } => {
            let site_ids = resolve_site_ids(api, sites.sites.as_deref())?;
            let deleted = page_tags::delete(
                api,
                PageTagArea::parse(&area)?,
                &site_ids,
                tag_id.as_deref(),
                query.as_deref(),
            )?;
            print_list("deleted", &deleted);
            Ok(())
        }
    }
}

fn run_bulk(session: &Session, command: BulkSubcommand) -> Result<()> {
    match command {
        BulkSubcommand::Import {
            id,
            file,
            format,
            mode,
        } => {
            let report = bulk::import(
                &session.client,
                &BulkImportOptions {
                    import_id: id,
                    file,
                    format,
                    mode,
                },
                JobPolling::from_env(),
                &session.paths.temp_root,
            )?;
            println!("process_id: {}", report.process_id);
            println!("progress: {}", report.progress);
            println!("items: {}", report.items);
            println!("success_count: {}", report.success_count);
            println!("failure_count: {}", report.failure_count);
            println!("duration: {}", report.duration);
            if let Some(path) = &report.report_path {
                println!("report_path: {}", normalize_path(path));
            }
            Ok(())
        }
    }
}

fn run_deploy(session: &Session, command: DeploySubcommand) -> Result<()> {
    match command {
        DeploySubcommand::Generate {
            revision,
            head,
            output,
            publish,
        } => {
            let rules = ClassifierRules {
                storefront_dir: session.settings.storefront_dir_name.clone(),
                email_sites: session.settings.email_sites.clone(),
            };
            let changed = GitChangedFiles::new(&session.settings.project_base);
            let generated = manifest::generate(
                &session.client,
                &changed,
                &rules,
                &GenerateOptions {
                    revision,
                    head,
                    output: output.clone(),
                    trigger_publish: publish,
                },
            )?;
            println!("operations: {}", generated.operations.len());
            println!("manifest: {}", normalize_path(&output));
            Ok(())
        }
        DeploySubcommand::Run {
            manifest: path,
            no_restore,
            sites,
        } => {
            let loaded = manifest::load(&path)?;
            let report = deploy::run(
                &session.client,
                &session.extension_context(),
                &loaded,
                &RunOptions {
                    polling: JobPolling::from_env(),
                    auto_restore: !no_restore,
                    sites: sites.sites,
                },
            )?;
            for step in &report.steps {
                println!(
                    "{} {}: done{}",
                    step.operation,
                    step.kind,
                    step.detail
                        .as_deref()
                        .map(|detail| format!(" ({detail})"))
                        .unwrap_or_default()
                );
            }
            println!("done: {}", report.steps.len());
            Ok(())
        }
    }
}

fn run_publish(session: &Session) -> Result<()> {
    let report = publish::trigger(
        &session.client,
        &session.settings.credentials.username,
        JobPolling::from_env(),
    )?;
    println!("workset_id: {}", report.workset_id);
    println!("polls: {}", report.polls);
    print_list("completed_phases", &report.completed_phases);
    Ok(())
}

fn run_files(session: &Session, command: FilesSubcommand) -> Result<()> {
    match command {
        FilesSubcommand::Upload { pattern, folder } => {
            let report =
                files::upload_files(&session.client, &session.settings, &pattern, folder.as_deref())?;
            println!("uploaded: {}", report.uploaded.len());
            for mapping in &report.uploaded {
                println!("{} -> {}", normalize_path(&mapping.file_path), mapping.remote);
            }
            Ok(())
        }
    }
}

fn run_extension(session: &Session, command: ExtensionSubcommand) -> Result<()> {
    let ctx = session.extension_context();
    match command {
        ExtensionSubcommand::Upload { kind, name } => {
            let report = extension::upload(&session.client, &ctx, ExtensionKind::parse(&kind)?, &name)?;
            println!("name: {}", report.name);
            println!("kind: {}", report.kind.as_str());
            println!("application_id: {}", report.application_id);
            println!("remote_file: {}", report.remote_file);
            println!("files: {}", report.files);
            print_list("warnings", &report.warnings);
            Ok(())
        }
        ExtensionSubcommand::Upgrade {
            kind,
            names,
            no_restore,
        } => {
            let reports = extension::upgrade(
                &session.client,
                &ctx,
                ExtensionKind::parse(&kind)?,
                &names,
                !no_restore,
            )?;
            for report in &reports {
                println!("{}.kind: {}", report.name, report.kind.as_str());
                if let Some(path) = &report.backup_file {
                    println!("{}.backup_file: {}", report.name, normalize_path(path));
                }
                if let Some(id) = &report.removed_extension {
                    println!("{}.removed_extension: {id}", report.name);
                }
            }
            Ok(())
        }
    }
}

fn run_widget(session: &Session, command: WidgetSubcommand) -> Result<()> {
    match command {
        WidgetSubcommand::Backup { name } => {
            let path =
                widget_backup::backup_to_file(&session.client, &name, &session.paths.backup_dir)?;
            println!("backup_file: {}", normalize_path(&path));
            Ok(())
        }
        WidgetSubcommand::Restore { name, file } => {
            let report = widget_restore::restore_from_file(
                &session.client,
                &session.extension_context(),
                &name,
                &file,
            )?;
            println!("widget_type: {}", report.widget_type);
            for (old_id, new_id) in &report.instances {
                println!("instance.{old_id}: {new_id}");
            }
            print_list("placed_layouts", &report.placed_layouts);
            println!("restored_locales: {}", report.restored_locales);
            print_list("restored_settings", &report.restored_settings);
            print_list("restored_layouts", &report.restored_layouts);
            Ok(())
        }
        WidgetSubcommand::Upload {
            name,
            files,
            js_files,
            no_backup,
            no_restore,
        } => {
            let files = if files.is_empty() && js_files.is_empty() {
                WidgetFile::ALL.to_vec()
            } else {
                files.iter().map(|file| WidgetFile::parse(file)).collect::<Result<Vec<_>>>()?
            };
            let options = UploadOptions {
                files,
                js_files,
                backup: !no_backup,
                auto_restore: !no_backup && !no_restore,
            };
            let version = VersionInfo::from_git(&session.settings.project_base)?;
            let report = widget::upload(
                &session.client,
                &session.extension_context(),
                &name,
                &options,
                &version,
            )?;
            println!("widget_type: {}", report.widget_type);
            print_list("folders", &report.folders);
            println!("instances: {}", report.instances);
            print_list("uploaded", &report.uploaded);
            if let Some(path) = &report.backup_file {
                println!("backup_file: {}", normalize_path(path));
            }
            Ok(())
        }
    }
}

fn run_theme(session: &Session, command: ThemeSubcommand) -> Result<()> {
    match command {
        ThemeSubcommand::Generate => {
            let report = theme::generate(&session.client, &session.settings)?;
            println!("theme_id: {}", report.theme_id);
            println!("output_dir: {}", normalize_path(&report.output_dir));
            println!("style_files: {}", report.style_files);
            println!("variable_files: {}", report.variable_files);
            println!("additional_style_files: {}", report.additional_style_files);
            Ok(())
        }
    }
}

fn run_sse(session: &Session, command: SseSubcommand) -> Result<()> {
    match command {
        SseSubcommand::Upload { names, skip } => {
            let reports =
                extension::upload_sses(&session.client, &session.extension_context(), &names, &skip)?;
            for report in &reports {
                println!("{}.files: {}", report.name, report.files);
            }
            println!("uploaded: {}", reports.len());
            Ok(())
        }
    }
}

fn print_site_responses(responses: &[SiteResponse]) -> Result<()> {
    for response in responses {
        if response.not_found {
            println!("{}: <not found>", response.site_id);
        } else {
            println!("{}: {}", response.site_id, serde_json::to_string_pretty(&response.body)?);
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_list(label: &str, values: &[String]) {
    if values.is_empty() {
        println!("{label}: <empty>");
    } else {
        println!("{label}: {}", values.join(", "));
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        config: runtime.config.clone(),
        temp_dir: runtime.temp_dir.clone(),
    };

    let initial = resolve_paths(&context, &overrides);
    let project_env = initial.config_dir().join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    Ok(resolve_paths(&context, &overrides))
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
