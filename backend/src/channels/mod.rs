// Channel Providers
//
// Thin transports for the two delivery channels. No business logic lives
// here: opt-out checks, template resolution, and counter bookkeeping are the
// dispatcher's job.

pub mod email;
pub mod sms;

pub use email::EmailProvider;
pub use sms::SmsProvider;
