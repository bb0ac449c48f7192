//! Миграции схемы панели управления узлами.

pub use sea_orm_migration::prelude::*;

mod m001_create_nodes;
mod m002_create_node_tokens;
mod m003_create_node_groups;
mod m004_create_node_assignments;
mod m005_create_node_installs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m001_create_nodes::Migration),
            Box::new(m002_create_node_tokens::Migration),
            Box::new(m003_create_node_groups::Migration),
            Box::new(m004_create_node_assignments::Migration),
            Box::new(m005_create_node_installs::Migration),
        ]
    }
}
