pub mod channel;
pub mod guild;
pub mod member;
pub mod role;
