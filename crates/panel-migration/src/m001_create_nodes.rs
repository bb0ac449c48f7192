//! Миграция: создание таблицы nodes.

use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m001_create_nodes"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Nodes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Nodes::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Nodes::Name).string().not_null())
                    .col(ColumnDef::new(Nodes::Region).string().not_null().default(""))
                    .col(ColumnDef::new(Nodes::Address).string().not_null())
                    .col(ColumnDef::new(Nodes::Port).integer().not_null())
                    .col(ColumnDef::new(Nodes::Weight).integer().not_null().default(1))
                    .col(ColumnDef::new(Nodes::MaxUsers).integer().not_null().default(0))
                    .col(
                        ColumnDef::new(Nodes::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Nodes::Status)
                            .string_len(16)
                            .not_null()
                            .default("offline"),
                    )
                    .col(ColumnDef::new(Nodes::LatencyMs).integer().not_null().default(0))
                    .col(ColumnDef::new(Nodes::LastSeenAt).string().null())
                    .col(
                        ColumnDef::new(Nodes::SyncStatus)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(Nodes::SyncedAt).string().null())
                    .col(
                        ColumnDef::new(Nodes::ConfigRevision)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Nodes::AppliedRevision)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Nodes::SyncError).string().null())
                    .col(ColumnDef::new(Nodes::Tags).text().not_null())
                    .col(ColumnDef::new(Nodes::IpWhitelist).text().not_null())
                    .col(ColumnDef::new(Nodes::CreatedAt).string().not_null())
                    .col(ColumnDef::new(Nodes::UpdatedAt).string().not_null())
                    .to_owned(),
            )
            .await?;

        // Индекс по региону для фильтра списка узлов
        manager
            .create_index(
                Index::create()
                    .table(Nodes::Table)
                    .col(Nodes::Region)
                    .name("idx_nodes_region")
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Nodes::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Nodes {
    Table,
    Id,
    Name,
    Region,
    Address,
    Port,
    Weight,
    MaxUsers,
    Enabled,
    Status,
    LatencyMs,
    LastSeenAt,
    SyncStatus,
    SyncedAt,
    ConfigRevision,
    AppliedRevision,
    SyncError,
    Tags,
    IpWhitelist,
    CreatedAt,
    UpdatedAt,
}
