//! Child-to-parent completion callbacks.

pub mod config;
mod router;
pub mod template;
mod trigger;

pub use config::EffectiveCallbackConfig;
pub use router::{CALLBACK_SOURCE, CallbackContext, CallbackRouter};
pub use trigger::{QueueTrigger, TriggerOptions};
