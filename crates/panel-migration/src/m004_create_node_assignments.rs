//! Миграция: закрепление пользователей за узлами.

use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m004_create_node_assignments"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(NodeAssignments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(NodeAssignments::UserId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(NodeAssignments::NodeId).integer().not_null())
                    .col(ColumnDef::new(NodeAssignments::AssignedAt).string().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_node_assignments_node")
                            .from(NodeAssignments::Table, NodeAssignments::NodeId)
                            .to(Nodes::Table, Nodes::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .table(NodeAssignments::Table)
                    .col(NodeAssignments::NodeId)
                    .name("idx_node_assignments_node_id")
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(NodeAssignments::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum NodeAssignments {
    Table,
    UserId,
    NodeId,
    AssignedAt,
}

#[derive(Iden)]
enum Nodes {
    Table,
    Id,
}
