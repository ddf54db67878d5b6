//! Notification transports.
//!
//! - `WebhookNotifier` = push gateway reached over HTTP (FCM-style multicast body)
//! - `LogNotifier`     = no gateway configured, notifications only go to the log

pub mod log;
pub mod webhook;

pub use self::log::LogNotifier;
pub use self::webhook::WebhookNotifier;
