pub mod users;

pub use users::{UpsertOutcome, UserProfile, UsersDao};
