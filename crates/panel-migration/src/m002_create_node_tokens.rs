//! Миграция: создание таблицы node_tokens.

use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m002_create_node_tokens"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(NodeTokens::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(NodeTokens::NodeId)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(NodeTokens::TokenHash)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(NodeTokens::IssuedAt).string().not_null())
                    .col(ColumnDef::new(NodeTokens::RevokedAt).string().null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_node_tokens_node")
                            .from(NodeTokens::Table, NodeTokens::NodeId)
                            .to(Nodes::Table, Nodes::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(NodeTokens::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum NodeTokens {
    Table,
    NodeId,
    TokenHash,
    IssuedAt,
    RevokedAt,
}

#[derive(Iden)]
enum Nodes {
    Table,
    Id,
}
