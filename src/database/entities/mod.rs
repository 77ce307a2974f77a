pub mod users;

pub use users::Entity as Users;

pub type UserRecord = users::Model;
