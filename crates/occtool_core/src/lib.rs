pub mod auth;
pub mod bulk;
pub mod config;
pub mod deploy;
pub mod extension;
pub mod files;
pub mod manifest;
pub mod page_tags;
pub mod parallel;
pub mod publish;
pub mod request;
pub mod runtime;
pub mod site_settings;
pub mod sites;
pub mod theme;
pub mod transport;
pub mod widget;
pub mod widget_backup;
pub mod widget_restore;
pub mod worksets;

#[cfg(test)]
pub(crate) mod test_support;
