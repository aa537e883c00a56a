pub mod adherence;
pub mod error;
pub mod health;
pub mod reminders;
