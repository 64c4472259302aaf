mod accounts;
mod config;
mod messages;
mod misc;

pub use accounts::{
    api_create_account, api_delete_account, api_get_account, api_list_accounts,
    api_oauth_exchange, api_update_account,
};
pub use config::{api_get_settings, api_put_settings, api_statistics};
pub use messages::api_messages;
pub use misc::{api_health, api_version};
