pub mod asset_request;
pub mod baler_config_request;
pub mod config_request;
pub mod dep_version_request;
pub mod entry_request;
pub mod path_request;
pub mod target_request;
