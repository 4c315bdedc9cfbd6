//! Schema for [`SeaOrmStore`](super::SeaOrmStore).
//!
//! ```rust,ignore
//! use ledgerlink::storage::{Migrator, run_migrations};
//!
//! run_migrations::<Migrator>(&db).await?;
//! ```

use sea_orm_migration::prelude::*;

use crate::error::{LedgerLinkError, Result};

/// Migrator carrying every ledgerlink table.
pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20250301_000001_create_ledgerlink_tables::Migration)]
    }
}

/// Run pending migrations.
pub async fn run_migrations<M: MigratorTrait>(db: &sea_orm::DatabaseConnection) -> Result<()> {
    M::up(db, None)
        .await
        .map_err(|e| LedgerLinkError::internal(format!("Migration failed: {}", e)))?;

    tracing::info!(target: "ledgerlink::storage", "Database migrations completed successfully");
    Ok(())
}

/// Roll back the last `steps` migrations (one if `None`).
pub async fn rollback_migration<M: MigratorTrait>(
    db: &sea_orm::DatabaseConnection,
    steps: Option<u32>,
) -> Result<()> {
    M::down(db, steps)
        .await
        .map_err(|e| LedgerLinkError::internal(format!("Rollback failed: {}", e)))?;

    tracing::info!(
        target: "ledgerlink::storage",
        "Rolled back {} migration(s)",
        steps.unwrap_or(1)
    );
    Ok(())
}

mod m20250301_000001_create_ledgerlink_tables {
    use sea_orm_migration::prelude::*;

    #[derive(DeriveMigrationName)]
    pub struct Migration;

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CreditBalances::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CreditBalances::UserId)
                                .string()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(CreditBalances::Balance).big_integer().not_null())
                        .col(
                            ColumnDef::new(CreditBalances::TotalRecharged)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CreditBalances::TotalConsumed)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CreditBalances::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::col(CreditBalances::Balance).gte(0))
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CreditTransactions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CreditTransactions::Id)
                                .string()
                                .not_null()
                                .primary_key(),
                        )
                        // Insertion order; breaks ties between equal timestamps.
                        .col(
                            ColumnDef::new(CreditTransactions::Seq)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(CreditTransactions::UserId).string().not_null())
                        .col(ColumnDef::new(CreditTransactions::Amount).big_integer().not_null())
                        .col(
                            ColumnDef::new(CreditTransactions::BalanceAfter)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CreditTransactions::Kind).string_len(32).not_null())
                        .col(ColumnDef::new(CreditTransactions::Description).text().not_null())
                        .col(ColumnDef::new(CreditTransactions::Metadata).json_binary().not_null())
                        .col(ColumnDef::new(CreditTransactions::GrantId).string().null())
                        .col(ColumnDef::new(CreditTransactions::DedupeKey).string().null())
                        .col(
                            ColumnDef::new(CreditTransactions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_credit_transactions_user_id")
                        .table(CreditTransactions::Table)
                        .col(CreditTransactions::UserId)
                        .col(CreditTransactions::CreatedAt)
                        .col(CreditTransactions::Seq)
                        .to_owned(),
                )
                .await?;

            // NULL dedupe keys never collide.
            manager
                .create_index(
                    Index::create()
                        .name("uq_credit_transactions_dedupe")
                        .table(CreditTransactions::Table)
                        .col(CreditTransactions::UserId)
                        .col(CreditTransactions::DedupeKey)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CreditGrants::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CreditGrants::Id)
                                .string()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(CreditGrants::UserId).string().not_null())
                        .col(ColumnDef::new(CreditGrants::SubscriptionRef).string().not_null())
                        .col(ColumnDef::new(CreditGrants::TotalCredits).big_integer().not_null())
                        .col(
                            ColumnDef::new(CreditGrants::RemainingCredits)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CreditGrants::StartsAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CreditGrants::EndsAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CreditGrants::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(CreditGrants::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::col(CreditGrants::RemainingCredits).gte(0))
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_credit_grants_user_id")
                        .table(CreditGrants::Table)
                        .col(CreditGrants::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_credit_grants_subscription_ref")
                        .table(CreditGrants::Table)
                        .col(CreditGrants::SubscriptionRef)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_credit_grants_status_ends_at")
                        .table(CreditGrants::Table)
                        .col(CreditGrants::Status)
                        .col(CreditGrants::EndsAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ReconciliationWarnings::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ReconciliationWarnings::Id)
                                .string()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(ReconciliationWarnings::UserId).string().not_null())
                        .col(ColumnDef::new(ReconciliationWarnings::GrantId).string().null())
                        .col(ColumnDef::new(ReconciliationWarnings::Message).text().not_null())
                        .col(
                            ColumnDef::new(ReconciliationWarnings::ExpectedAmount)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ReconciliationWarnings::AppliedAmount)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ReconciliationWarnings::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CustomerLinks::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CustomerLinks::Id)
                                .string()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(CustomerLinks::UserId).string().not_null())
                        .col(ColumnDef::new(CustomerLinks::ExternalRef).string().not_null())
                        .col(ColumnDef::new(CustomerLinks::Strategy).string_len(32).not_null())
                        .col(ColumnDef::new(CustomerLinks::Confidence).string_len(16).not_null())
                        .col(ColumnDef::new(CustomerLinks::Status).string_len(16).not_null())
                        .col(ColumnDef::new(CustomerLinks::Note).text().null())
                        .col(
                            ColumnDef::new(CustomerLinks::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CustomerLinks::SupersededAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            // One active link per reference and per user. Superseded rows are history.
            let db = manager.get_connection();
            db.execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS uq_customer_links_active_ref \
                 ON customer_links (external_ref) WHERE status = 'active'",
            )
            .await?;
            db.execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS uq_customer_links_active_user \
                 ON customer_links (user_id) WHERE status = 'active'",
            )
            .await?;

            manager
                .create_table(
                    Table::create()
                        .table(UnresolvedReferences::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(UnresolvedReferences::ExternalRef)
                                .string()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(UnresolvedReferences::Status).string_len(16).not_null())
                        .col(ColumnDef::new(UnresolvedReferences::Context).json_binary().not_null())
                        .col(ColumnDef::new(UnresolvedReferences::Reason).string_len(64).not_null())
                        .col(
                            ColumnDef::new(UnresolvedReferences::Candidates)
                                .json_binary()
                                .not_null(),
                        )
                        .col(ColumnDef::new(UnresolvedReferences::Attempts).integer().not_null())
                        .col(
                            ColumnDef::new(UnresolvedReferences::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(UnresolvedReferences::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(UnresolvedReferences::ResolvedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(UnresolvedReferences::ResolvedUserId).string().null())
                        .col(ColumnDef::new(UnresolvedReferences::Note).text().null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_unresolved_references_status")
                        .table(UnresolvedReferences::Table)
                        .col(UnresolvedReferences::Status)
                        .col(UnresolvedReferences::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ParkedEvents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ParkedEvents::EventKey)
                                .string()
                                .not_null()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(ParkedEvents::Seq)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(ParkedEvents::ExternalRef).string().not_null())
                        .col(ColumnDef::new(ParkedEvents::EventType).string_len(64).not_null())
                        .col(ColumnDef::new(ParkedEvents::Payload).json_binary().not_null())
                        .col(ColumnDef::new(ParkedEvents::Status).string_len(16).not_null())
                        .col(ColumnDef::new(ParkedEvents::Reason).string_len(64).not_null())
                        .col(
                            ColumnDef::new(ParkedEvents::ParkedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ParkedEvents::ReplayedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_parked_events_external_ref")
                        .table(ParkedEvents::Table)
                        .col(ParkedEvents::ExternalRef)
                        .col(ParkedEvents::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(AppliedEvents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(AppliedEvents::EventKey)
                                .string()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(AppliedEvents::EventType).string_len(64).not_null())
                        .col(ColumnDef::new(AppliedEvents::Result).json_binary().not_null())
                        .col(
                            ColumnDef::new(AppliedEvents::AppliedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_applied_events_applied_at")
                        .table(AppliedEvents::Table)
                        .col(AppliedEvents::AppliedAt)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(AppliedEvents::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ParkedEvents::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(UnresolvedReferences::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(CustomerLinks::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ReconciliationWarnings::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(CreditGrants::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(CreditTransactions::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(CreditBalances::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum CreditBalances {
        Table,
        UserId,
        Balance,
        TotalRecharged,
        TotalConsumed,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum CreditTransactions {
        Table,
        Id,
        Seq,
        UserId,
        Amount,
        BalanceAfter,
        Kind, // consumption, bonus, recharge, expiry
        Description,
        Metadata,
        GrantId,
        DedupeKey,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum CreditGrants {
        Table,
        Id,
        UserId,
        SubscriptionRef,
        TotalCredits,
        RemainingCredits,
        StartsAt,
        EndsAt,
        Status, // active, expired, canceled
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum ReconciliationWarnings {
        Table,
        Id,
        UserId,
        GrantId,
        Message,
        ExpectedAmount,
        AppliedAmount,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum CustomerLinks {
        Table,
        Id,
        UserId,
        ExternalRef,
        Strategy,
        Confidence,
        Status, // active, superseded
        Note,
        CreatedAt,
        SupersededAt,
    }

    #[derive(DeriveIden)]
    enum UnresolvedReferences {
        Table,
        ExternalRef,
        Status, // pending, resolved, abandoned
        Context,
        Reason,
        Candidates,
        Attempts,
        CreatedAt,
        UpdatedAt,
        ResolvedAt,
        ResolvedUserId,
        Note,
    }

    #[derive(DeriveIden)]
    enum ParkedEvents {
        Table,
        EventKey,
        Seq,
        ExternalRef,
        EventType,
        Payload,
        Status, // parked, replayed
        Reason,
        ParkedAt,
        ReplayedAt,
    }

    #[derive(DeriveIden)]
    enum AppliedEvents {
        Table,
        EventKey,
        EventType,
        Result,
        AppliedAt,
    }
}
