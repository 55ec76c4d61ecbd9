#![deny(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::too_many_lines
)]

pub mod channel;
pub mod event;
pub mod field;
pub mod guild;
pub mod id;
pub mod member;
pub mod message;
pub mod role;
pub mod stats;
pub mod user;

pub use chrono;
pub use twilight_model as discord;
