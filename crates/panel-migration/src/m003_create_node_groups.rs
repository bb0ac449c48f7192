//! Миграция: группы узлов и таблица членства.

use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m003_create_node_groups"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(NodeGroups::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(NodeGroups::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(NodeGroups::Name).string().not_null())
                    .col(
                        ColumnDef::new(NodeGroups::Description)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(NodeGroups::Region)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(NodeGroups::Strategy)
                            .string_len(32)
                            .not_null()
                            .default("round-robin"),
                    )
                    .col(ColumnDef::new(NodeGroups::CreatedAt).string().not_null())
                    .col(ColumnDef::new(NodeGroups::UpdatedAt).string().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(NodeGroupMembers::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(NodeGroupMembers::GroupId).integer().not_null())
                    .col(ColumnDef::new(NodeGroupMembers::NodeId).integer().not_null())
                    .col(ColumnDef::new(NodeGroupMembers::AddedAt).string().not_null())
                    .primary_key(
                        Index::create()
                            .col(NodeGroupMembers::GroupId)
                            .col(NodeGroupMembers::NodeId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_node_group_members_group")
                            .from(NodeGroupMembers::Table, NodeGroupMembers::GroupId)
                            .to(NodeGroups::Table, NodeGroups::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_node_group_members_node")
                            .from(NodeGroupMembers::Table, NodeGroupMembers::NodeId)
                            .to(Nodes::Table, Nodes::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Индекс по node_id: каскад и выборка групп узла
        manager
            .create_index(
                Index::create()
                    .table(NodeGroupMembers::Table)
                    .col(NodeGroupMembers::NodeId)
                    .name("idx_node_group_members_node_id")
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(NodeGroupMembers::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(NodeGroups::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum NodeGroups {
    Table,
    Id,
    Name,
    Description,
    Region,
    Strategy,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum NodeGroupMembers {
    Table,
    GroupId,
    NodeId,
    AddedAt,
}

#[derive(Iden)]
enum Nodes {
    Table,
    Id,
}
