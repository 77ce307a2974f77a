use sea_orm_migration::prelude::*;

pub use sea_orm_migration::MigratorTrait;

mod m20250101_000001_create_users_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20250101_000001_create_users_table::Migration)]
    }
}

#[derive(Iden)]
pub enum Users {
    Table,
    Id,
    TelegramId,
    Username,
    FirstName,
    LastName,
    LanguageCode,
    PhotoUrl,
    IsPremium,
    CreatedAt,
    UpdatedAt,
    LastLogin,
    IsActive,
}
