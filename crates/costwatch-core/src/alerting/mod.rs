//! Alerting for CostWatch
//!
//! Turns bucketed cost into alert windows and delivers deduplicated
//! notifications for the recent ones.

mod dispatcher;
mod notifier;
mod repository;
mod windows;

pub(crate) use dispatcher::chrono_duration;
pub use dispatcher::{format_message, DispatchPolicy, DispatchReport, NotificationDispatcher};
pub use notifier::{Notifier, WebhookNotifier};
pub use repository::{AlertRepository, StaticRuleRepository};
pub use windows::{detect_windows, AlertWindowEngine};
