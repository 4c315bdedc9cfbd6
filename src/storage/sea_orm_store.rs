//! SeaORM-backed persistence.
//!
//! Implements [`LedgerStore`], [`IdentityStore`] and [`AppliedEventStore`] on
//! one connection. Ledger writes run in a transaction that locks the user's
//! balance row first, so writes for one user serialize in the database and
//! the dedupe check cannot race. The local user directory belongs to the
//! host application and is not provided here.
//!
//! ```rust,ignore
//! use ledgerlink::storage::{Migrator, SeaOrmStore, run_migrations};
//!
//! run_migrations::<Migrator>(&db).await?;
//! let store = Arc::new(SeaOrmStore::new(db.clone()));
//! let ledger = CreditLedger::new(store.clone());
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    NotSet, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait, entity::prelude::*,
    sea_query::OnConflict,
};

use crate::error::{LedgerLinkError, LinkOwner, Result};
use crate::identity::{
    Confidence, CustomerLink, IdentityStore, LinkStatus, LinkWrite, MatchStrategy, ParkedEvent,
    ParkedStatus, UnresolvedReference, UnresolvedStatus,
};
use crate::ledger::{
    ApplyOutcome, CreditBalance, CreditGrant, CreditTransaction, GrantEffect, GrantStatus,
    LedgerMutation, LedgerStore, ReconciliationWarning, TransactionKind,
};
use crate::reconciler::{AppliedEvent, AppliedEventStore};

// =============================================================================
// SeaORM Entities
// =============================================================================

mod entity {
    pub mod credit_balance {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "credit_balances")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub user_id: String,
            pub balance: i64,
            pub total_recharged: i64,
            pub total_consumed: i64,
            pub updated_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod credit_transaction {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "credit_transactions")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            /// Assigned by the database on insert.
            pub seq: i64,
            pub user_id: String,
            pub amount: i64,
            pub balance_after: i64,
            pub kind: String,
            pub description: String,
            #[sea_orm(column_type = "JsonBinary")]
            pub metadata: Json,
            pub grant_id: Option<String>,
            pub dedupe_key: Option<String>,
            pub created_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod credit_grant {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "credit_grants")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            pub user_id: String,
            pub subscription_ref: String,
            pub total_credits: i64,
            pub remaining_credits: i64,
            pub starts_at: DateTimeWithTimeZone,
            pub ends_at: DateTimeWithTimeZone,
            pub status: String,
            pub created_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod reconciliation_warning {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "reconciliation_warnings")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            pub user_id: String,
            pub grant_id: Option<String>,
            pub message: String,
            pub expected_amount: i64,
            pub applied_amount: i64,
            pub created_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod customer_link {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "customer_links")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            pub user_id: String,
            pub external_ref: String,
            pub strategy: String,
            pub confidence: String,
            pub status: String,
            pub note: Option<String>,
            pub created_at: DateTimeWithTimeZone,
            pub superseded_at: Option<DateTimeWithTimeZone>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod unresolved_reference {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "unresolved_references")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub external_ref: String,
            pub status: String,
            #[sea_orm(column_type = "JsonBinary")]
            pub context: Json,
            pub reason: String,
            #[sea_orm(column_type = "JsonBinary")]
            pub candidates: Json,
            pub attempts: i32,
            pub created_at: DateTimeWithTimeZone,
            pub updated_at: DateTimeWithTimeZone,
            pub resolved_at: Option<DateTimeWithTimeZone>,
            pub resolved_user_id: Option<String>,
            pub note: Option<String>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod parked_event {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "parked_events")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub event_key: String,
            pub seq: i64,
            pub external_ref: String,
            pub event_type: String,
            #[sea_orm(column_type = "JsonBinary")]
            pub payload: Json,
            pub status: String,
            pub reason: String,
            pub parked_at: DateTimeWithTimeZone,
            pub replayed_at: Option<DateTimeWithTimeZone>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod applied_event {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "applied_events")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub event_key: String,
            pub event_type: String,
            #[sea_orm(column_type = "JsonBinary")]
            pub result: Json,
            pub applied_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{
    applied_event, credit_balance, credit_grant, credit_transaction, customer_link, parked_event,
    reconciliation_warning, unresolved_reference,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn db_err(e: DbErr) -> LedgerLinkError {
    LedgerLinkError::Database(e.to_string())
}

fn is_unique_violation(e: &DbErr) -> bool {
    matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

#[inline]
fn to_db_time(dt: DateTime<Utc>) -> DateTimeWithTimeZone {
    dt.fixed_offset()
}

#[inline]
fn from_db_time(dt: DateTimeWithTimeZone) -> DateTime<Utc> {
    dt.with_timezone(&Utc)
}

/// Convert i32 to u32 safely (negative values become 0).
#[inline]
fn i32_to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// Convert u32 to i32 safely (values > i32::MAX become i32::MAX).
#[inline]
fn u32_to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn unknown_value(column: &str, value: &str) -> LedgerLinkError {
    LedgerLinkError::storage(format!("unknown {} value in database: {}", column, value))
}

fn model_to_balance(model: credit_balance::Model) -> CreditBalance {
    CreditBalance {
        user_id: model.user_id,
        balance: model.balance,
        total_recharged: model.total_recharged,
        total_consumed: model.total_consumed,
        updated_at: from_db_time(model.updated_at),
    }
}

fn model_to_transaction(model: credit_transaction::Model) -> Result<CreditTransaction> {
    let kind = TransactionKind::parse(&model.kind)
        .ok_or_else(|| unknown_value("transaction kind", &model.kind))?;
    Ok(CreditTransaction {
        id: model.id,
        user_id: model.user_id,
        amount: model.amount,
        balance_after: model.balance_after,
        kind,
        description: model.description,
        metadata: model.metadata,
        grant_id: model.grant_id,
        dedupe_key: model.dedupe_key,
        created_at: from_db_time(model.created_at),
    })
}

fn transaction_to_active_model(tx: &CreditTransaction) -> credit_transaction::ActiveModel {
    credit_transaction::ActiveModel {
        id: Set(tx.id.clone()),
        seq: NotSet,
        user_id: Set(tx.user_id.clone()),
        amount: Set(tx.amount),
        balance_after: Set(tx.balance_after),
        kind: Set(tx.kind.as_str().to_string()),
        description: Set(tx.description.clone()),
        metadata: Set(tx.metadata.clone()),
        grant_id: Set(tx.grant_id.clone()),
        dedupe_key: Set(tx.dedupe_key.clone()),
        created_at: Set(to_db_time(tx.created_at)),
    }
}

fn model_to_grant(model: credit_grant::Model) -> Result<CreditGrant> {
    let status = GrantStatus::parse(&model.status)
        .ok_or_else(|| unknown_value("grant status", &model.status))?;
    Ok(CreditGrant {
        id: model.id,
        user_id: model.user_id,
        subscription_ref: model.subscription_ref,
        total_credits: model.total_credits,
        remaining_credits: model.remaining_credits,
        starts_at: from_db_time(model.starts_at),
        ends_at: from_db_time(model.ends_at),
        status,
        created_at: from_db_time(model.created_at),
    })
}

fn grant_to_active_model(grant: &CreditGrant) -> credit_grant::ActiveModel {
    credit_grant::ActiveModel {
        id: Set(grant.id.clone()),
        user_id: Set(grant.user_id.clone()),
        subscription_ref: Set(grant.subscription_ref.clone()),
        total_credits: Set(grant.total_credits),
        remaining_credits: Set(grant.remaining_credits),
        starts_at: Set(to_db_time(grant.starts_at)),
        ends_at: Set(to_db_time(grant.ends_at)),
        status: Set(grant.status.as_str().to_string()),
        created_at: Set(to_db_time(grant.created_at)),
    }
}

fn model_to_warning(model: reconciliation_warning::Model) -> ReconciliationWarning {
    ReconciliationWarning {
        id: model.id,
        user_id: model.user_id,
        grant_id: model.grant_id,
        message: model.message,
        expected_amount: model.expected_amount,
        applied_amount: model.applied_amount,
        created_at: from_db_time(model.created_at),
    }
}

fn model_to_link(model: customer_link::Model) -> Result<CustomerLink> {
    let strategy = MatchStrategy::parse(&model.strategy)
        .ok_or_else(|| unknown_value("link strategy", &model.strategy))?;
    let confidence: Confidence = model
        .confidence
        .parse()
        .map_err(|_| unknown_value("link confidence", &model.confidence))?;
    let status = LinkStatus::parse(&model.status)
        .ok_or_else(|| unknown_value("link status", &model.status))?;
    Ok(CustomerLink {
        id: model.id,
        user_id: model.user_id,
        external_ref: model.external_ref,
        strategy,
        confidence,
        status,
        note: model.note,
        created_at: from_db_time(model.created_at),
        superseded_at: model.superseded_at.map(from_db_time),
    })
}

fn link_to_active_model(link: &CustomerLink) -> customer_link::ActiveModel {
    customer_link::ActiveModel {
        id: Set(link.id.clone()),
        user_id: Set(link.user_id.clone()),
        external_ref: Set(link.external_ref.clone()),
        strategy: Set(link.strategy.as_str().to_string()),
        confidence: Set(link.confidence.as_str().to_string()),
        status: Set(link.status.as_str().to_string()),
        note: Set(link.note.clone()),
        created_at: Set(to_db_time(link.created_at)),
        superseded_at: Set(link.superseded_at.map(to_db_time)),
    }
}

fn model_to_unresolved(model: unresolved_reference::Model) -> Result<UnresolvedReference> {
    let status = UnresolvedStatus::parse(&model.status)
        .ok_or_else(|| unknown_value("unresolved status", &model.status))?;
    Ok(UnresolvedReference {
        external_ref: model.external_ref,
        status,
        context: serde_json::from_value(model.context)?,
        reason: model.reason,
        candidates: serde_json::from_value(model.candidates)?,
        attempts: i32_to_u32(model.attempts),
        created_at: from_db_time(model.created_at),
        updated_at: from_db_time(model.updated_at),
        resolved_at: model.resolved_at.map(from_db_time),
        resolved_user_id: model.resolved_user_id,
        note: model.note,
    })
}

fn unresolved_to_active_model(
    reference: &UnresolvedReference,
) -> Result<unresolved_reference::ActiveModel> {
    Ok(unresolved_reference::ActiveModel {
        external_ref: Set(reference.external_ref.clone()),
        status: Set(reference.status.as_str().to_string()),
        context: Set(serde_json::to_value(&reference.context)?),
        reason: Set(reference.reason.clone()),
        candidates: Set(serde_json::to_value(&reference.candidates)?),
        attempts: Set(u32_to_i32(reference.attempts)),
        created_at: Set(to_db_time(reference.created_at)),
        updated_at: Set(to_db_time(reference.updated_at)),
        resolved_at: Set(reference.resolved_at.map(to_db_time)),
        resolved_user_id: Set(reference.resolved_user_id.clone()),
        note: Set(reference.note.clone()),
    })
}

fn model_to_parked(model: parked_event::Model) -> Result<ParkedEvent> {
    let status = ParkedStatus::parse(&model.status)
        .ok_or_else(|| unknown_value("parked status", &model.status))?;
    Ok(ParkedEvent {
        event_key: model.event_key,
        external_ref: model.external_ref,
        event_type: model.event_type,
        payload: model.payload,
        status,
        reason: model.reason,
        parked_at: from_db_time(model.parked_at),
        replayed_at: model.replayed_at.map(from_db_time),
    })
}

fn model_to_applied(model: applied_event::Model) -> Result<AppliedEvent> {
    Ok(AppliedEvent {
        event_key: model.event_key,
        event_type: model.event_type,
        result: serde_json::from_value(model.result)?,
        applied_at: from_db_time(model.applied_at),
    })
}

/// Insert a zero balance row if the user has none.
async fn ensure_balance_row<C: ConnectionTrait>(conn: &C, user_id: &str) -> Result<()> {
    let empty = CreditBalance::empty(user_id);
    let row = credit_balance::ActiveModel {
        user_id: Set(empty.user_id),
        balance: Set(0),
        total_recharged: Set(0),
        total_consumed: Set(0),
        updated_at: Set(to_db_time(empty.updated_at)),
    };
    credit_balance::Entity::insert(row)
        .on_conflict(
            OnConflict::column(credit_balance::Column::UserId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// Write a grant effect inside the caller's transaction. Any error leaves the
/// transaction to be rolled back.
async fn write_grant_effect<C: ConnectionTrait>(conn: &C, effect: &GrantEffect) -> Result<()> {
    match effect {
        GrantEffect::Open(grant) => {
            credit_grant::Entity::insert(grant_to_active_model(grant))
                .exec(conn)
                .await
                .map_err(db_err)?;
        }
        GrantEffect::Draw(draws) => {
            for draw in draws {
                let model = credit_grant::Entity::find_by_id(draw.grant_id.as_str())
                    .lock_exclusive()
                    .one(conn)
                    .await
                    .map_err(db_err)?
                    .ok_or_else(|| LedgerLinkError::not_found("grant", &draw.grant_id))?;
                if model.remaining_credits < draw.amount {
                    return Err(LedgerLinkError::storage(format!(
                        "grant {} has {} credits left, draw of {} refused",
                        model.id, model.remaining_credits, draw.amount
                    )));
                }
                let remaining = model.remaining_credits - draw.amount;
                let mut active: credit_grant::ActiveModel = model.into();
                active.remaining_credits = Set(remaining);
                active.update(conn).await.map_err(db_err)?;
            }
        }
        GrantEffect::Close { grant_id, status } => {
            let model = credit_grant::Entity::find_by_id(grant_id.as_str())
                .lock_exclusive()
                .one(conn)
                .await
                .map_err(db_err)?
                .ok_or_else(|| LedgerLinkError::not_found("grant", grant_id))?;
            let mut active: credit_grant::ActiveModel = model.into();
            active.status = Set(status.as_str().to_string());
            if *status == GrantStatus::Expired {
                active.remaining_credits = Set(0);
            }
            active.update(conn).await.map_err(db_err)?;
        }
    }
    Ok(())
}

async fn active_link_by_ref<C: ConnectionTrait>(
    conn: &C,
    external_ref: &str,
) -> Result<Option<customer_link::Model>> {
    customer_link::Entity::find()
        .filter(customer_link::Column::ExternalRef.eq(external_ref))
        .filter(customer_link::Column::Status.eq(LinkStatus::Active.as_str()))
        .one(conn)
        .await
        .map_err(db_err)
}

async fn active_link_by_user<C: ConnectionTrait>(
    conn: &C,
    user_id: &str,
) -> Result<Option<customer_link::Model>> {
    customer_link::Entity::find()
        .filter(customer_link::Column::UserId.eq(user_id))
        .filter(customer_link::Column::Status.eq(LinkStatus::Active.as_str()))
        .one(conn)
        .await
        .map_err(db_err)
}

/// What blocks `link` from being written, if anything.
async fn blocking_link<C: ConnectionTrait>(
    conn: &C,
    link: &CustomerLink,
) -> Result<Option<LinkWrite>> {
    if let Some(existing) = active_link_by_ref(conn, &link.external_ref).await? {
        if existing.user_id == link.user_id {
            return Ok(Some(LinkWrite::AlreadyLinked(model_to_link(existing)?)));
        }
        return Ok(Some(LinkWrite::Conflict(LinkOwner::ReferenceClaimedBy {
            user_id: existing.user_id,
        })));
    }
    if let Some(existing) = active_link_by_user(conn, &link.user_id).await? {
        return Ok(Some(LinkWrite::Conflict(LinkOwner::UserLinkedTo {
            external_ref: existing.external_ref,
        })));
    }
    Ok(None)
}

// =============================================================================
// SeaOrmStore
// =============================================================================

/// SeaORM-backed store implementing the ledger, identity and applied-event traits.
#[derive(Clone, Debug)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Get a reference to the underlying database connection.
    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl LedgerStore for SeaOrmStore {
    async fn get_balance(&self, user_id: &str) -> Result<Option<CreditBalance>> {
        let model = credit_balance::Entity::find_by_id(user_id)
            .one(&self.db)
            .await
            .map_err(db_err)?;
        Ok(model.map(model_to_balance))
    }

    async fn ensure_balance(&self, user_id: &str) -> Result<CreditBalance> {
        ensure_balance_row(&self.db, user_id).await?;
        credit_balance::Entity::find_by_id(user_id)
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(model_to_balance)
            .ok_or_else(|| LedgerLinkError::storage("balance row missing after insert"))
    }

    async fn apply(&self, mutation: LedgerMutation) -> Result<ApplyOutcome> {
        tracing::debug!(
            target: "ledgerlink::storage",
            user_id = %mutation.user_id,
            amount = mutation.amount,
            kind = %mutation.kind.as_str(),
            "applying ledger mutation"
        );

        let txn = self.db.begin().await.map_err(db_err)?;

        // The row lock serializes every write for this user.
        ensure_balance_row(&txn, &mutation.user_id).await?;
        let current = credit_balance::Entity::find_by_id(mutation.user_id.as_str())
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(db_err)?
            .ok_or_else(|| LedgerLinkError::storage("balance row missing after insert"))?;
        let current_balance = model_to_balance(current.clone());

        if let Some(key) = &mutation.dedupe_key {
            let existing = credit_transaction::Entity::find()
                .filter(credit_transaction::Column::UserId.eq(mutation.user_id.as_str()))
                .filter(credit_transaction::Column::DedupeKey.eq(key.as_str()))
                .one(&txn)
                .await
                .map_err(db_err)?;
            if let Some(model) = existing {
                txn.rollback().await.map_err(db_err)?;
                return Ok(ApplyOutcome::Duplicate {
                    transaction: model_to_transaction(model)?,
                    balance: current_balance,
                });
            }
        }

        let next = match current_balance.with_amount(mutation.amount) {
            Ok(next) => next,
            Err(e) => {
                txn.rollback().await.map_err(db_err)?;
                return Err(e);
            }
        };
        if next.balance < 0 {
            txn.rollback().await.map_err(db_err)?;
            return Ok(ApplyOutcome::Insufficient {
                balance: current_balance,
            });
        }

        if let Some(effect) = &mutation.grant_effect {
            write_grant_effect(&txn, effect).await?;
        }

        let transaction = mutation.to_transaction(next.balance);
        credit_transaction::Entity::insert(transaction_to_active_model(&transaction))
            .exec(&txn)
            .await
            .map_err(db_err)?;

        let mut balance: credit_balance::ActiveModel = current.into();
        balance.balance = Set(next.balance);
        balance.total_recharged = Set(next.total_recharged);
        balance.total_consumed = Set(next.total_consumed);
        balance.updated_at = Set(to_db_time(next.updated_at));
        balance.update(&txn).await.map_err(db_err)?;

        txn.commit().await.map_err(db_err)?;

        Ok(ApplyOutcome::Applied {
            transaction,
            balance: next,
        })
    }

    async fn find_by_dedupe_key(
        &self,
        user_id: &str,
        dedupe_key: &str,
    ) -> Result<Option<CreditTransaction>> {
        credit_transaction::Entity::find()
            .filter(credit_transaction::Column::UserId.eq(user_id))
            .filter(credit_transaction::Column::DedupeKey.eq(dedupe_key))
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(model_to_transaction)
            .transpose()
    }

    async fn list_transactions(&self, user_id: &str) -> Result<Vec<CreditTransaction>> {
        credit_transaction::Entity::find()
            .filter(credit_transaction::Column::UserId.eq(user_id))
            .order_by_asc(credit_transaction::Column::CreatedAt)
            .order_by_asc(credit_transaction::Column::Seq)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(model_to_transaction)
            .collect()
    }

    async fn get_grant(&self, grant_id: &str) -> Result<Option<CreditGrant>> {
        credit_grant::Entity::find_by_id(grant_id)
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(model_to_grant)
            .transpose()
    }

    async fn list_grants_by_subscription(&self, subscription_ref: &str) -> Result<Vec<CreditGrant>> {
        credit_grant::Entity::find()
            .filter(credit_grant::Column::SubscriptionRef.eq(subscription_ref))
            .order_by_asc(credit_grant::Column::CreatedAt)
            .order_by_asc(credit_grant::Column::Id)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(model_to_grant)
            .collect()
    }

    async fn list_grants(&self, user_id: &str) -> Result<Vec<CreditGrant>> {
        credit_grant::Entity::find()
            .filter(credit_grant::Column::UserId.eq(user_id))
            .order_by_asc(credit_grant::Column::CreatedAt)
            .order_by_asc(credit_grant::Column::Id)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(model_to_grant)
            .collect()
    }

    async fn list_lapsed_grants(&self, now: DateTime<Utc>) -> Result<Vec<CreditGrant>> {
        credit_grant::Entity::find()
            .filter(credit_grant::Column::Status.ne(GrantStatus::Expired.as_str()))
            .filter(credit_grant::Column::EndsAt.lte(to_db_time(now)))
            .order_by_asc(credit_grant::Column::EndsAt)
            .order_by_asc(credit_grant::Column::Id)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(model_to_grant)
            .collect()
    }

    async fn list_drawable_grants(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<CreditGrant>> {
        credit_grant::Entity::find()
            .filter(credit_grant::Column::UserId.eq(user_id))
            .filter(credit_grant::Column::Status.ne(GrantStatus::Expired.as_str()))
            .filter(credit_grant::Column::EndsAt.gt(to_db_time(now)))
            .filter(credit_grant::Column::RemainingCredits.gt(0))
            .order_by_asc(credit_grant::Column::EndsAt)
            .order_by_asc(credit_grant::Column::CreatedAt)
            .order_by_asc(credit_grant::Column::Id)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(model_to_grant)
            .collect()
    }

    async fn update_grant_status(&self, grant_id: &str, status: GrantStatus) -> Result<()> {
        write_grant_effect(
            &self.db,
            &GrantEffect::Close {
                grant_id: grant_id.to_string(),
                status,
            },
        )
        .await
    }

    async fn record_warning(&self, warning: &ReconciliationWarning) -> Result<()> {
        let row = reconciliation_warning::ActiveModel {
            id: Set(warning.id.clone()),
            user_id: Set(warning.user_id.clone()),
            grant_id: Set(warning.grant_id.clone()),
            message: Set(warning.message.clone()),
            expected_amount: Set(warning.expected_amount),
            applied_amount: Set(warning.applied_amount),
            created_at: Set(to_db_time(warning.created_at)),
        };
        reconciliation_warning::Entity::insert(row)
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_warnings(&self, limit: usize) -> Result<Vec<ReconciliationWarning>> {
        let models = reconciliation_warning::Entity::find()
            .order_by_desc(reconciliation_warning::Column::CreatedAt)
            .order_by_desc(reconciliation_warning::Column::Id)
            .limit(limit as u64)
            .all(&self.db)
            .await
            .map_err(db_err)?;
        Ok(models.into_iter().map(model_to_warning).collect())
    }
}

#[async_trait]
impl IdentityStore for SeaOrmStore {
    async fn find_link_by_ref(&self, external_ref: &str) -> Result<Option<CustomerLink>> {
        active_link_by_ref(&self.db, external_ref)
            .await?
            .map(model_to_link)
            .transpose()
    }

    async fn find_link_by_user(&self, user_id: &str) -> Result<Option<CustomerLink>> {
        active_link_by_user(&self.db, user_id)
            .await?
            .map(model_to_link)
            .transpose()
    }

    async fn list_links_for_ref(&self, external_ref: &str) -> Result<Vec<CustomerLink>> {
        customer_link::Entity::find()
            .filter(customer_link::Column::ExternalRef.eq(external_ref))
            .order_by_asc(customer_link::Column::CreatedAt)
            .order_by_asc(customer_link::Column::Id)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(model_to_link)
            .collect()
    }

    async fn create_link(&self, link: &CustomerLink) -> Result<LinkWrite> {
        if let Some(blocked) = blocking_link(&self.db, link).await? {
            return Ok(blocked);
        }

        match customer_link::Entity::insert(link_to_active_model(link))
            .exec(&self.db)
            .await
        {
            Ok(_) => Ok(LinkWrite::Created(link.clone())),
            // A concurrent writer won one of the partial unique indexes.
            Err(e) if is_unique_violation(&e) => blocking_link(&self.db, link)
                .await?
                .ok_or_else(|| LedgerLinkError::storage(format!("link insert rejected: {}", e))),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn replace_link(&self, superseded_id: &str, link: &CustomerLink) -> Result<LinkWrite> {
        let txn = self.db.begin().await.map_err(db_err)?;

        let superseded = customer_link::Entity::find_by_id(superseded_id)
            .filter(customer_link::Column::Status.eq(LinkStatus::Active.as_str()))
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(db_err)?
            .ok_or_else(|| LedgerLinkError::not_found("customer_link", superseded_id))?;

        if let Some(other) = active_link_by_user(&txn, &link.user_id).await? {
            if other.id != superseded.id {
                return Ok(LinkWrite::Conflict(LinkOwner::UserLinkedTo {
                    external_ref: other.external_ref,
                }));
            }
        }
        if let Some(other) = active_link_by_ref(&txn, &link.external_ref).await? {
            if other.id != superseded.id {
                return Ok(LinkWrite::Conflict(LinkOwner::ReferenceClaimedBy {
                    user_id: other.user_id,
                }));
            }
        }

        let mut old: customer_link::ActiveModel = superseded.into();
        old.status = Set(LinkStatus::Superseded.as_str().to_string());
        old.superseded_at = Set(Some(to_db_time(Utc::now())));
        old.update(&txn).await.map_err(db_err)?;

        customer_link::Entity::insert(link_to_active_model(link))
            .exec(&txn)
            .await
            .map_err(db_err)?;

        txn.commit().await.map_err(db_err)?;
        Ok(LinkWrite::Created(link.clone()))
    }

    async fn upsert_unresolved(&self, reference: &UnresolvedReference) -> Result<UnresolvedReference> {
        let txn = self.db.begin().await.map_err(db_err)?;

        let inserted = unresolved_reference::Entity::insert(unresolved_to_active_model(reference)?)
            .on_conflict(
                OnConflict::column(unresolved_reference::Column::ExternalRef)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&txn)
            .await
            .map_err(db_err)?;
        if inserted > 0 {
            txn.commit().await.map_err(db_err)?;
            return Ok(reference.clone());
        }

        let model = unresolved_reference::Entity::find_by_id(reference.external_ref.as_str())
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(db_err)?
            .ok_or_else(|| LedgerLinkError::storage("unresolved row missing after conflict"))?;
        let mut existing = model_to_unresolved(model)?;
        existing.absorb(reference);

        let mut row = unresolved_to_active_model(&existing)?;
        // Keep the original creation time.
        row.created_at = sea_orm::ActiveValue::NotSet;
        row.update(&txn).await.map_err(db_err)?;

        txn.commit().await.map_err(db_err)?;
        Ok(existing)
    }

    async fn get_unresolved(&self, external_ref: &str) -> Result<Option<UnresolvedReference>> {
        unresolved_reference::Entity::find_by_id(external_ref)
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(model_to_unresolved)
            .transpose()
    }

    async fn list_unresolved(&self, status: UnresolvedStatus) -> Result<Vec<UnresolvedReference>> {
        unresolved_reference::Entity::find()
            .filter(unresolved_reference::Column::Status.eq(status.as_str()))
            .order_by_asc(unresolved_reference::Column::CreatedAt)
            .order_by_asc(unresolved_reference::Column::ExternalRef)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(model_to_unresolved)
            .collect()
    }

    async fn mark_resolved(&self, external_ref: &str, user_id: &str) -> Result<bool> {
        let now = to_db_time(Utc::now());
        let result = unresolved_reference::Entity::update_many()
            .col_expr(
                unresolved_reference::Column::Status,
                Expr::value(UnresolvedStatus::Resolved.as_str()),
            )
            .col_expr(unresolved_reference::Column::ResolvedAt, Expr::value(now))
            .col_expr(
                unresolved_reference::Column::ResolvedUserId,
                Expr::value(user_id),
            )
            .col_expr(unresolved_reference::Column::UpdatedAt, Expr::value(now))
            .filter(unresolved_reference::Column::ExternalRef.eq(external_ref))
            .filter(unresolved_reference::Column::Status.eq(UnresolvedStatus::Pending.as_str()))
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected > 0)
    }

    async fn mark_abandoned(&self, external_ref: &str, note: Option<&str>) -> Result<bool> {
        let result = unresolved_reference::Entity::update_many()
            .col_expr(
                unresolved_reference::Column::Status,
                Expr::value(UnresolvedStatus::Abandoned.as_str()),
            )
            .col_expr(
                unresolved_reference::Column::Note,
                Expr::value(note.map(String::from)),
            )
            .col_expr(
                unresolved_reference::Column::UpdatedAt,
                Expr::value(to_db_time(Utc::now())),
            )
            .filter(unresolved_reference::Column::ExternalRef.eq(external_ref))
            .filter(unresolved_reference::Column::Status.eq(UnresolvedStatus::Pending.as_str()))
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected > 0)
    }

    async fn park_event(&self, event: &ParkedEvent) -> Result<bool> {
        let row = parked_event::ActiveModel {
            event_key: Set(event.event_key.clone()),
            seq: NotSet,
            external_ref: Set(event.external_ref.clone()),
            event_type: Set(event.event_type.clone()),
            payload: Set(event.payload.clone()),
            status: Set(event.status.as_str().to_string()),
            reason: Set(event.reason.clone()),
            parked_at: Set(to_db_time(event.parked_at)),
            replayed_at: Set(event.replayed_at.map(to_db_time)),
        };
        let inserted = parked_event::Entity::insert(row)
            .on_conflict(
                OnConflict::column(parked_event::Column::EventKey)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(db_err)?;
        Ok(inserted > 0)
    }

    async fn list_parked(&self, external_ref: &str) -> Result<Vec<ParkedEvent>> {
        parked_event::Entity::find()
            .filter(parked_event::Column::ExternalRef.eq(external_ref))
            .filter(parked_event::Column::Status.eq(ParkedStatus::Parked.as_str()))
            .order_by_asc(parked_event::Column::ParkedAt)
            .order_by_asc(parked_event::Column::Seq)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(model_to_parked)
            .collect()
    }

    async fn mark_parked_replayed(&self, event_key: &str) -> Result<()> {
        parked_event::Entity::update_many()
            .col_expr(
                parked_event::Column::Status,
                Expr::value(ParkedStatus::Replayed.as_str()),
            )
            .col_expr(
                parked_event::Column::ReplayedAt,
                Expr::value(to_db_time(Utc::now())),
            )
            .filter(parked_event::Column::EventKey.eq(event_key))
            .filter(parked_event::Column::Status.eq(ParkedStatus::Parked.as_str()))
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl AppliedEventStore for SeaOrmStore {
    async fn get(&self, event_key: &str) -> Result<Option<AppliedEvent>> {
        applied_event::Entity::find_by_id(event_key)
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(model_to_applied)
            .transpose()
    }

    async fn record(&self, event: AppliedEvent) -> Result<bool> {
        let row = applied_event::ActiveModel {
            event_key: Set(event.event_key.clone()),
            event_type: Set(event.event_type.clone()),
            result: Set(serde_json::to_value(&event.result)?),
            applied_at: Set(to_db_time(event.applied_at)),
        };
        let inserted = applied_event::Entity::insert(row)
            .on_conflict(
                OnConflict::column(applied_event::Column::EventKey)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(db_err)?;
        Ok(inserted > 0)
    }

    async fn cleanup_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let result = applied_event::Entity::delete_many()
            .filter(applied_event::Column::AppliedAt.lt(to_db_time(cutoff)))
            .exec(&self.db)
            .await
            .map_err(db_err)?;

        tracing::info!(
            target: "ledgerlink::storage",
            removed = result.rows_affected,
            days = days,
            "Cleaned up applied event records"
        );
        Ok(result.rows_affected)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ReferenceContext;
    use crate::reconciler::AppliedResult;

    #[test]
    fn test_model_to_link_round_trips_enums() {
        let link = CustomerLink::new("user_1", "cus_abc", MatchStrategy::Email)
            .with_note(Some("matched on email".to_string()));
        let active = link_to_active_model(&link);
        let model = customer_link::Model {
            id: link.id.clone(),
            user_id: "user_1".to_string(),
            external_ref: "cus_abc".to_string(),
            strategy: "email".to_string(),
            confidence: "medium".to_string(),
            status: "active".to_string(),
            note: Some("matched on email".to_string()),
            created_at: to_db_time(link.created_at),
            superseded_at: None,
        };

        assert!(matches!(active.strategy, Set(ref s) if s == "email"));
        assert_eq!(model_to_link(model).unwrap(), link);
    }

    #[test]
    fn test_unknown_status_is_storage_error() {
        let model = credit_grant::Model {
            id: "g1".to_string(),
            user_id: "user_1".to_string(),
            subscription_ref: "sub_1".to_string(),
            total_credits: 10,
            remaining_credits: 10,
            starts_at: Utc::now().fixed_offset(),
            ends_at: Utc::now().fixed_offset(),
            status: "paused".to_string(),
            created_at: Utc::now().fixed_offset(),
        };
        let err = model_to_grant(model).unwrap_err();
        assert_eq!(err.code(), "storage_error");
    }

    #[test]
    fn test_unresolved_context_stored_as_json() {
        let reference = UnresolvedReference::pending(
            "cus_abc",
            ReferenceContext {
                email: Some("a@b.com".to_string()),
                ..ReferenceContext::default()
            },
            "no_candidate",
            vec!["user_1".to_string()],
        );
        let active = unresolved_to_active_model(&reference).unwrap();
        assert!(matches!(active.context, Set(ref v) if v["email"] == "a@b.com"));
        assert!(matches!(active.attempts, Set(1)));
    }

    #[test]
    fn test_applied_result_round_trip() {
        let result = AppliedResult::Credited {
            user_id: "user_1".to_string(),
            transaction_id: "tx_1".to_string(),
            added: 100,
            balance: 100,
        };
        let model = applied_event::Model {
            event_key: "evt_1".to_string(),
            event_type: "invoice_paid".to_string(),
            result: serde_json::to_value(&result).unwrap(),
            applied_at: Utc::now().fixed_offset(),
        };
        assert_eq!(model_to_applied(model).unwrap().result, result);
    }

    #[test]
    fn test_transaction_sequence_left_to_database() {
        let tx = LedgerMutation::new("user_1", 5, TransactionKind::Bonus, "seed").to_transaction(5);
        let active = transaction_to_active_model(&tx);
        assert!(matches!(active.seq, NotSet));
        assert!(matches!(active.id, Set(ref id) if *id == tx.id));

        let model = credit_transaction::Model {
            id: tx.id.clone(),
            seq: 42,
            user_id: "user_1".to_string(),
            amount: 5,
            balance_after: 5,
            kind: "bonus".to_string(),
            description: "seed".to_string(),
            metadata: serde_json::Value::Null,
            grant_id: None,
            dedupe_key: None,
            created_at: to_db_time(tx.created_at),
        };
        assert_eq!(model_to_transaction(model).unwrap(), tx);
    }

    #[test]
    fn test_safe_integer_conversions() {
        assert_eq!(i32_to_u32(-1), 0);
        assert_eq!(i32_to_u32(7), 7);
        assert_eq!(u32_to_i32(u32::MAX), i32::MAX);
    }
}
