use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

use crate::config::CONFIG;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(CONFIG.openrouter_timeout_seconds.max(1)))
        .user_agent(concat!("shortform_storyboard/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
});

pub fn get_http_client() -> &'static Client {
    &HTTP_CLIENT
}
