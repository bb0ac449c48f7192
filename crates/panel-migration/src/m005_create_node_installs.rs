//! Миграция: результаты автоустановки узлов.

use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m005_create_node_installs"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(NodeInstalls::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(NodeInstalls::NodeId)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(NodeInstalls::Success).boolean().not_null())
                    .col(ColumnDef::new(NodeInstalls::FailedStep).string().null())
                    .col(ColumnDef::new(NodeInstalls::ErrorCode).string().null())
                    .col(ColumnDef::new(NodeInstalls::Steps).text().not_null())
                    .col(ColumnDef::new(NodeInstalls::Logs).text().not_null())
                    .col(ColumnDef::new(NodeInstalls::StartedAt).string().not_null())
                    .col(ColumnDef::new(NodeInstalls::FinishedAt).string().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_node_installs_node")
                            .from(NodeInstalls::Table, NodeInstalls::NodeId)
                            .to(Nodes::Table, Nodes::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(NodeInstalls::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum NodeInstalls {
    Table,
    NodeId,
    Success,
    FailedStep,
    ErrorCode,
    Steps,
    Logs,
    StartedAt,
    FinishedAt,
}

#[derive(Iden)]
enum Nodes {
    Table,
    Id,
}
