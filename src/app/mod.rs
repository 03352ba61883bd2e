pub mod annotation;
pub mod localization_step;
pub mod notification;

pub use localization_step::{LocalizationStep, PreviewFeed};
pub use notification::{Notification, NotificationLevel, Notifier};
