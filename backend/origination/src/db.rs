//! Database layer: migrations, contract and progress queries, and the
//! transactional step commit.

use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::errors::{OriginationError, Result};
use crate::models::{
    ApplicationProgress, ApplicationSnapshot, CommitOutcome, Contract, ContractStatus,
    NewContract, ProgressPatch, StepData,
};
use crate::steps::{derive_current_step, CurrentStep, Step};

const CONTRACT_COLUMNS: &str = r#"
    id, contract_number, merchant_id, customer_id, amount, down_payment,
    financed_amount, term_months, interest_rate, monthly_payment, current_step,
    status, archived, archive_reason, archived_at, tokenization_status, token_id,
    blockchain_tx_hash, created_at, updated_at
"#;

const PROGRESS_COLUMNS: &str =
    "id, contract_id, step, completed, data, created_at, updated_at";

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // Every connection to `:memory:` opens a fresh database.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&format_create(&url))
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Make sure the file is created if it doesn't exist yet.
fn format_create(url: &str) -> String {
    if url.contains(":memory:") || url.contains("mode=") {
        url.to_string()
    } else if url.contains('?') {
        format!("{url}&mode=rwc")
    } else {
        format!("{url}?mode=rwc")
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

// ─────────────────────────────────────────────────────────
// Contracts
// ─────────────────────────────────────────────────────────

/// Originate a contract. Financed amount and monthly payment are computed
/// from the offer; the contract number is derived from the new row id.
pub async fn insert_contract(pool: &SqlitePool, offer: &NewContract) -> Result<Contract> {
    offer.validate()?;
    let ts = now();
    let mut tx = pool.begin().await?;

    let id = sqlx::query(
        r#"
        INSERT INTO contracts
            (merchant_id, customer_id, amount, down_payment, financed_amount,
             term_months, interest_rate, monthly_payment, current_step, status,
             created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'terms', 'pending', ?9, ?9)
        "#,
    )
    .bind(offer.merchant_id)
    .bind(offer.customer_id)
    .bind(offer.amount)
    .bind(offer.down_payment)
    .bind(offer.financed_amount())
    .bind(offer.term_months)
    .bind(offer.interest_rate)
    .bind(offer.monthly_payment())
    .bind(ts)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    let number = format!("FIN-{}-{id:06}", Utc::now().format("%Y%m%d"));
    sqlx::query("UPDATE contracts SET contract_number = ?1 WHERE id = ?2")
        .bind(&number)
        .bind(id)
        .execute(&mut *tx)
        .await?;

    let contract = fetch_contract(&mut tx, id).await?;
    tx.commit().await?;

    info!("Originated contract {number} for merchant {}", offer.merchant_id);
    Ok(contract)
}

/// Fetch a contract by id.
pub async fn get_contract(pool: &SqlitePool, id: i64) -> Result<Contract> {
    let mut conn = pool.acquire().await?;
    fetch_contract(&mut conn, id).await
}

/// Resolve a human-readable contract number.
pub async fn get_contract_by_number(pool: &SqlitePool, number: &str) -> Result<Contract> {
    sqlx::query_as::<_, Contract>(&format!(
        "SELECT {CONTRACT_COLUMNS} FROM contracts WHERE contract_number = ?1"
    ))
    .bind(number)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| OriginationError::ContractNotFound(number.to_string()))
}

/// List contracts, newest first, optionally filtered.
pub async fn list_contracts(
    pool: &SqlitePool,
    status: Option<ContractStatus>,
    archived: Option<bool>,
) -> Result<Vec<Contract>> {
    let rows = sqlx::query_as::<_, Contract>(&format!(
        r#"
        SELECT {CONTRACT_COLUMNS}
        FROM   contracts
        WHERE  (?1 IS NULL OR status = ?1)
          AND  (?2 IS NULL OR archived = ?2)
        ORDER  BY id DESC
        "#
    ))
    .bind(status.map(|s| s.as_str()))
    .bind(archived)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Set the contract's `current_step`.
///
/// Only the step derived from the progress rows is accepted, so the contract
/// can neither run ahead of nor lag behind its progress.
pub async fn update_contract_step(
    pool: &SqlitePool,
    contract_id: i64,
    step: CurrentStep,
) -> Result<Contract> {
    let mut tx = pool.begin().await?;
    let contract = fetch_contract(&mut tx, contract_id).await?;
    if contract.current_step == step {
        return Ok(contract);
    }

    let rows = fetch_progress(&mut tx, contract_id).await?;
    let derived = derive_current_step(rows.iter().map(|p| (p.step, p.completed)));
    if step != derived {
        return Err(OriginationError::illegal(contract.current_step, step));
    }

    sqlx::query("UPDATE contracts SET current_step = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(step.as_str())
        .bind(now())
        .bind(contract_id)
        .execute(&mut *tx)
        .await?;
    let contract = fetch_contract(&mut tx, contract_id).await?;
    tx.commit().await?;

    debug!("Contract {contract_id} moved to step {step}");
    Ok(contract)
}

/// Change a contract's status along the forward-only lifecycle.
/// `active` additionally requires every step to be complete.
pub async fn update_contract_status(
    pool: &SqlitePool,
    contract_id: i64,
    status: ContractStatus,
) -> Result<Contract> {
    let mut tx = pool.begin().await?;
    let contract = fetch_contract(&mut tx, contract_id).await?;
    if contract.status == status {
        return Ok(contract);
    }
    if !contract.status.can_transition_to(status) {
        return Err(OriginationError::IllegalTransition {
            from: contract.status.to_string(),
            to: status.to_string(),
        });
    }
    if status == ContractStatus::Active {
        let rows = fetch_progress(&mut tx, contract_id).await?;
        let derived = derive_current_step(rows.iter().map(|p| (p.step, p.completed)));
        if !derived.is_completed() {
            return Err(OriginationError::IllegalTransition {
                from: derived.to_string(),
                to: status.to_string(),
            });
        }
    }

    sqlx::query("UPDATE contracts SET status = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(status.as_str())
        .bind(now())
        .bind(contract_id)
        .execute(&mut *tx)
        .await?;
    let contract = fetch_contract(&mut tx, contract_id).await?;
    tx.commit().await?;

    info!("Contract {contract_id} status → {status}");
    Ok(contract)
}

/// Archive a contract with a reason.
pub async fn archive_contract(pool: &SqlitePool, contract_id: i64, reason: &str) -> Result<Contract> {
    if reason.trim().is_empty() {
        return Err(OriginationError::Validation(
            "an archive reason is required".to_string(),
        ));
    }
    let mut tx = pool.begin().await?;
    let contract = fetch_contract(&mut tx, contract_id).await?;
    if contract.archived {
        return Err(OriginationError::Validation(format!(
            "contract {contract_id} is already archived"
        )));
    }
    let ts = now();
    sqlx::query(
        r#"
        UPDATE contracts
        SET    archived = 1, archive_reason = ?1, archived_at = ?2, updated_at = ?2
        WHERE  id = ?3
        "#,
    )
    .bind(reason.trim())
    .bind(ts)
    .bind(contract_id)
    .execute(&mut *tx)
    .await?;
    let contract = fetch_contract(&mut tx, contract_id).await?;
    tx.commit().await?;

    info!("Contract {contract_id} archived: {reason}");
    Ok(contract)
}

// ─────────────────────────────────────────────────────────
// Application progress
// ─────────────────────────────────────────────────────────

/// Fetch all progress rows of a contract, in step order.
pub async fn list_progress(pool: &SqlitePool, contract_id: i64) -> Result<Vec<ApplicationProgress>> {
    let mut conn = pool.acquire().await?;
    fetch_progress(&mut conn, contract_id).await
}

/// Fetch one progress row by id.
pub async fn get_progress(pool: &SqlitePool, progress_id: i64) -> Result<ApplicationProgress> {
    let mut conn = pool.acquire().await?;
    fetch_progress_row(&mut conn, progress_id).await
}

/// Contract, progress rows and derived current step in one read.
pub async fn load_application(pool: &SqlitePool, contract_id: i64) -> Result<ApplicationSnapshot> {
    let mut conn = pool.acquire().await?;
    let contract = fetch_contract(&mut conn, contract_id).await?;
    let progress = fetch_progress(&mut conn, contract_id).await?;
    Ok(ApplicationSnapshot::new(contract, progress))
}

/// Return the row for `(contract_id, step)`, creating an empty one on first
/// visit. A row may only be created once every earlier step is complete.
pub async fn ensure_progress(
    pool: &SqlitePool,
    contract_id: i64,
    step: Step,
) -> Result<ApplicationProgress> {
    let mut tx = pool.begin().await?;
    let contract = fetch_contract(&mut tx, contract_id).await?;
    let rows = fetch_progress(&mut tx, contract_id).await?;
    if let Some(existing) = rows.iter().find(|p| p.step == step) {
        return Ok(existing.clone());
    }

    let missing = step
        .predecessors()
        .iter()
        .find(|s| !rows.iter().any(|p| p.step == **s && p.completed));
    if let Some(missing) = missing {
        return Err(OriginationError::illegal(
            CurrentStep::from(*missing),
            step,
        ));
    }

    let ts = now();
    let id = sqlx::query(
        r#"
        INSERT INTO application_progress (contract_id, step, completed, data, created_at, updated_at)
        VALUES (?1, ?2, 0, NULL, ?3, ?3)
        "#,
    )
    .bind(contract.id)
    .bind(step.as_str())
    .bind(ts)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();
    let row = fetch_progress_row(&mut tx, id).await?;
    tx.commit().await?;

    debug!("Created {step} progress row {id} for contract {contract_id}");
    Ok(row)
}

/// Update one progress row.
///
/// Completing a row goes through the state machine: it must be the first
/// incomplete step of its contract. Clearing `completed` is only allowed on
/// the last completed step of a pending contract, which is what compensating
/// a failed multi-call commit needs.
pub async fn patch_progress(
    pool: &SqlitePool,
    progress_id: i64,
    patch: &ProgressPatch,
) -> Result<ApplicationProgress> {
    let mut tx = pool.begin().await?;
    let row = fetch_progress_row(&mut tx, progress_id).await?;
    if let Some(data) = &patch.data {
        data.ensure_step(row.step)?;
    }

    if patch.completed != row.completed {
        fetch_contract(&mut tx, row.contract_id).await?.ensure_open()?;
        let rows = fetch_progress(&mut tx, row.contract_id).await?;
        if patch.completed {
            let derived = derive_current_step(rows.iter().map(|p| (p.step, p.completed)));
            derived.apply(row.step.completion_edge())?;
        } else if let Some(later) = rows
            .iter()
            .find(|p| p.completed && p.step.position() > row.step.position())
        {
            return Err(OriginationError::illegal(
                CurrentStep::from(later.step),
                row.step,
            ));
        }
    }

    let data = match &patch.data {
        Some(d) => Some(d.encode()?),
        None => row.data.clone(),
    };
    sqlx::query(
        "UPDATE application_progress SET completed = ?1, data = ?2, updated_at = ?3 WHERE id = ?4",
    )
    .bind(patch.completed)
    .bind(data)
    .bind(now())
    .bind(progress_id)
    .execute(&mut *tx)
    .await?;
    let row = fetch_progress_row(&mut tx, progress_id).await?;
    tx.commit().await?;
    Ok(row)
}

/// Complete `step` and advance the contract in one transaction.
///
/// Re-committing an already completed step changes nothing and reports
/// `already_completed`. Completing `signing` sets `current_step` to
/// `completed` and activates the contract.
pub async fn commit_step(
    pool: &SqlitePool,
    contract_id: i64,
    step: Step,
    data: &StepData,
) -> Result<CommitOutcome> {
    data.ensure_step(step)?;
    let encoded = data.encode()?;

    let mut tx = pool.begin().await?;
    let contract = fetch_contract(&mut tx, contract_id).await?;
    let rows = fetch_progress(&mut tx, contract_id).await?;

    if let Some(done) = rows.iter().find(|p| p.step == step && p.completed) {
        debug!("Step {step} of contract {contract_id} already completed");
        return Ok(CommitOutcome {
            contract,
            progress: done.clone(),
            already_completed: true,
        });
    }

    contract.ensure_open()?;

    let derived = derive_current_step(rows.iter().map(|p| (p.step, p.completed)));
    let next = derived.apply(step.completion_edge())?;

    let ts = now();
    sqlx::query(
        r#"
        INSERT INTO application_progress (contract_id, step, completed, data, created_at, updated_at)
        VALUES (?1, ?2, 1, ?3, ?4, ?4)
        ON CONFLICT (contract_id, step)
        DO UPDATE SET completed = 1, data = excluded.data, updated_at = excluded.updated_at
        "#,
    )
    .bind(contract_id)
    .bind(step.as_str())
    .bind(&encoded)
    .bind(ts)
    .execute(&mut *tx)
    .await?;

    let status = if next.is_completed() {
        ContractStatus::Active
    } else {
        contract.status
    };
    sqlx::query(
        "UPDATE contracts SET current_step = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
    )
    .bind(next.as_str())
    .bind(status.as_str())
    .bind(ts)
    .bind(contract_id)
    .execute(&mut *tx)
    .await?;

    let contract = fetch_contract(&mut tx, contract_id).await?;
    let progress = sqlx::query_as::<_, ApplicationProgress>(&format!(
        "SELECT {PROGRESS_COLUMNS} FROM application_progress WHERE contract_id = ?1 AND step = ?2"
    ))
    .bind(contract_id)
    .bind(step.as_str())
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    info!("Contract {contract_id}: {step} completed → {next}");
    if next.is_completed() {
        info!("Contract {contract_id} activated");
    }
    Ok(CommitOutcome {
        contract,
        progress,
        already_completed: false,
    })
}

// ─────────────────────────────────────────────────────────
// Connection-level helpers
// ─────────────────────────────────────────────────────────

async fn fetch_contract(conn: &mut SqliteConnection, id: i64) -> Result<Contract> {
    sqlx::query_as::<_, Contract>(&format!(
        "SELECT {CONTRACT_COLUMNS} FROM contracts WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| OriginationError::ContractNotFound(id.to_string()))
}

async fn fetch_progress(
    conn: &mut SqliteConnection,
    contract_id: i64,
) -> Result<Vec<ApplicationProgress>> {
    let mut rows = sqlx::query_as::<_, ApplicationProgress>(&format!(
        "SELECT {PROGRESS_COLUMNS} FROM application_progress WHERE contract_id = ?1"
    ))
    .bind(contract_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.sort_by_key(|p| p.step.position());
    Ok(rows)
}

async fn fetch_progress_row(
    conn: &mut SqliteConnection,
    progress_id: i64,
) -> Result<ApplicationProgress> {
    sqlx::query_as::<_, ApplicationProgress>(&format!(
        "SELECT {PROGRESS_COLUMNS} FROM application_progress WHERE id = ?1"
    ))
    .bind(progress_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(OriginationError::ProgressNotFound(progress_id))
}
