//! Warden Monitor
//!
//! Runtime watchdogs that never block governed work:
//!
//! - [`LoopDetector`]: Normal → Suspicious → Fatal per operation id
//! - [`NotificationBroadcaster`]: routed, bounded, worker-pool delivery to
//!   log, alert-log and webhook channels

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod loop_detector;
pub mod notify;

pub use loop_detector::{
    CheckpointOutcome, InfiniteLoopError, LoopDetector, LoopDetectorConfig, LoopProfile, LoopState,
};
pub use notify::{
    AlertLogChannel, ChannelError, LogChannel, Notification, NotificationBroadcaster,
    NotificationChannel, NotificationConfig, NotificationStats, NotifyReceipt, RouteConfig,
    WebhookChannel,
};
