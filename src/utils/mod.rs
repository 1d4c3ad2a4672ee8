pub mod document;
pub mod http;
pub mod json;
pub mod language;
pub mod logging;
pub mod pool;
pub mod timing;
