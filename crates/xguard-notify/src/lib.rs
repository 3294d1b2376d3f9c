pub mod limiter;
pub mod telegram;

pub use limiter::NotifyLimiter;
pub use telegram::{
    NotifyError,
    TelegramNotifier,
};
