//! SQLite governance store
//!
//! Records are stored as JSON bodies next to the columns used for lookups
//! and ordering (id, DAO, status, timestamps). A commit runs every
//! [`StoreOp`] inside one SQLite transaction; an error drops the transaction
//! and rolls everything back.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Params};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{GovernanceError, GovernanceResult};
use crate::funding::{FundingRequest, FundingStatus};
use crate::milestone::{MilestoneStatus, MilestoneVerification};
use crate::store::{GovernanceStore, StoreOp};
use crate::types::{
    Dao, DaoMember, InvestmentAllocation, Proposal, ProposalStatus, RecordFilter, StatusLabel,
    TreasuryTransaction, Vote,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS daos (
    id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS members (
    dao_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    joined_at INTEGER NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (dao_id, user_id)
);

CREATE TABLE IF NOT EXISTS proposals (
    id TEXT PRIMARY KEY,
    dao_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_proposals_dao_status ON proposals(dao_id, status);

CREATE TABLE IF NOT EXISTS votes (
    proposal_id TEXT NOT NULL,
    voter TEXT NOT NULL,
    cast_at INTEGER NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (proposal_id, voter)
);

CREATE TABLE IF NOT EXISTS funding_requests (
    id TEXT PRIMARY KEY,
    dao_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_funding_dao_status ON funding_requests(dao_id, status);

CREATE TABLE IF NOT EXISTS milestones (
    id TEXT PRIMARY KEY,
    dao_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_milestones_dao_status ON milestones(dao_id, status);

CREATE TABLE IF NOT EXISTS treasury_transactions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    dao_id TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_dao ON treasury_transactions(dao_id);

CREATE TABLE IF NOT EXISTS investments (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    dao_id TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_investments_dao ON investments(dao_id);
";

/// SQLite-backed [`GovernanceStore`]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn new<P: AsRef<Path>>(db_path: P) -> GovernanceResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                GovernanceError::Storage(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| GovernanceError::Storage(format!("Failed to open database: {}", e)))?;
        Self::create_tables(&conn)?;

        info!("Opened governance database at {}", db_path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (useful for testing)
    pub fn in_memory() -> GovernanceResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            GovernanceError::Storage(format!("Failed to open in-memory database: {}", e))
        })?;
        Self::create_tables(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_tables(conn: &Connection) -> GovernanceResult<()> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| GovernanceError::Storage(format!("Failed to create tables: {}", e)))
    }
}

fn to_json<T: Serialize>(value: &T) -> GovernanceResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn load_one<T: DeserializeOwned, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> GovernanceResult<Option<T>> {
    let body: Option<String> = conn.query_row(sql, params, |row| row.get(0)).optional()?;
    body.map(|b| serde_json::from_str(&b))
        .transpose()
        .map_err(GovernanceError::from)
}

fn load_many<T: DeserializeOwned, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> GovernanceResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;

    let mut records = Vec::new();
    for body in rows {
        records.push(serde_json::from_str(&body?)?);
    }
    Ok(records)
}

fn load_dao(conn: &Connection, dao_id: &str) -> GovernanceResult<Dao> {
    load_one(conn, "SELECT body FROM daos WHERE id = ?1", params![dao_id])?
        .ok_or_else(|| GovernanceError::not_found("DAO", dao_id))
}

fn save_dao(conn: &Connection, dao: &Dao) -> GovernanceResult<()> {
    conn.execute(
        "INSERT INTO daos (id, created_at, body) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET body = excluded.body",
        params![dao.id, dao.created_at.timestamp_millis(), to_json(dao)?],
    )?;
    Ok(())
}

fn apply_op(conn: &Connection, op: StoreOp) -> GovernanceResult<()> {
    match op {
        StoreOp::PutDao(dao) => save_dao(conn, &dao)?,
        StoreOp::UpdateDaoParameters { dao_id, parameters } => {
            let mut dao = load_dao(conn, &dao_id)?;
            dao.parameters = parameters;
            save_dao(conn, &dao)?;
        }
        StoreOp::DebitTreasury { dao_id, amount } => {
            let mut dao = load_dao(conn, &dao_id)?;
            if dao.treasury_balance < amount {
                return Err(GovernanceError::InsufficientTreasury {
                    need: amount,
                    have: dao.treasury_balance,
                });
            }
            dao.treasury_balance -= amount;
            save_dao(conn, &dao)?;
        }
        StoreOp::CreditTreasury { dao_id, amount } => {
            let mut dao = load_dao(conn, &dao_id)?;
            dao.treasury_balance = dao.treasury_balance.checked_add(amount).ok_or_else(|| {
                GovernanceError::Validation("treasury balance overflow".to_string())
            })?;
            save_dao(conn, &dao)?;
        }
        StoreOp::PutMember(member) => {
            conn.execute(
                "INSERT INTO members (dao_id, user_id, joined_at, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(dao_id, user_id) DO UPDATE SET
                    joined_at = excluded.joined_at,
                    body = excluded.body",
                params![
                    member.dao_id,
                    member.user_id,
                    member.joined_at.timestamp_millis(),
                    to_json(&member)?
                ],
            )?;
        }
        StoreOp::RemoveMember { dao_id, user_id } => {
            let removed = conn.execute(
                "DELETE FROM members WHERE dao_id = ?1 AND user_id = ?2",
                params![dao_id, user_id],
            )?;
            if removed == 0 {
                return Err(GovernanceError::not_found("Member", format!("{}/{}", dao_id, user_id)));
            }
        }
        StoreOp::PutProposal(proposal) => {
            conn.execute(
                "INSERT INTO proposals (id, dao_id, status, created_at, body) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    body = excluded.body",
                params![
                    proposal.id,
                    proposal.dao_id,
                    proposal.status.as_str(),
                    proposal.created_at.timestamp_millis(),
                    to_json(&proposal)?
                ],
            )?;
        }
        StoreOp::PutVote(vote) => {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM votes WHERE proposal_id = ?1 AND voter = ?2",
                    params![vote.proposal_id, vote.voter],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(GovernanceError::StateConflict(format!(
                    "{} already voted on {}",
                    vote.voter, vote.proposal_id
                )));
            }
            conn.execute(
                "INSERT INTO votes (proposal_id, voter, cast_at, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    vote.proposal_id,
                    vote.voter,
                    vote.cast_at.timestamp_millis(),
                    to_json(&vote)?
                ],
            )?;
        }
        StoreOp::PutFundingRequest(request) => {
            conn.execute(
                "INSERT INTO funding_requests (id, dao_id, status, created_at, body) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    body = excluded.body",
                params![
                    request.id,
                    request.dao_id,
                    request.status.as_str(),
                    request.created_at.timestamp_millis(),
                    to_json(&request)?
                ],
            )?;
        }
        StoreOp::PutMilestone(milestone) => {
            conn.execute(
                "INSERT INTO milestones (id, dao_id, status, created_at, body) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    body = excluded.body",
                params![
                    milestone.id,
                    milestone.dao_id,
                    milestone.status.as_str(),
                    milestone.created_at.timestamp_millis(),
                    to_json(&milestone)?
                ],
            )?;
        }
        StoreOp::RecordTransaction(tx) => {
            conn.execute(
                "INSERT INTO treasury_transactions (id, dao_id, body) VALUES (?1, ?2, ?3)",
                params![tx.id, tx.dao_id, to_json(&tx)?],
            )?;
        }
        StoreOp::RecordInvestment(allocation) => {
            conn.execute(
                "INSERT INTO investments (id, dao_id, body) VALUES (?1, ?2, ?3)",
                params![allocation.id, allocation.dao_id, to_json(&allocation)?],
            )?;
        }
    }
    Ok(())
}

#[async_trait]
impl GovernanceStore for SqliteStore {
    async fn dao(&self, dao_id: &str) -> GovernanceResult<Option<Dao>> {
        let conn = self.conn.lock().await;
        load_one(&conn, "SELECT body FROM daos WHERE id = ?1", params![dao_id])
    }

    async fn daos(&self) -> GovernanceResult<Vec<Dao>> {
        let conn = self.conn.lock().await;
        load_many(&conn, "SELECT body FROM daos ORDER BY created_at, id", [])
    }

    async fn member(&self, dao_id: &str, user_id: &str) -> GovernanceResult<Option<DaoMember>> {
        let conn = self.conn.lock().await;
        load_one(
            &conn,
            "SELECT body FROM members WHERE dao_id = ?1 AND user_id = ?2",
            params![dao_id, user_id],
        )
    }

    async fn members(&self, dao_id: &str) -> GovernanceResult<Vec<DaoMember>> {
        let conn = self.conn.lock().await;
        load_many(
            &conn,
            "SELECT body FROM members WHERE dao_id = ?1 ORDER BY joined_at, user_id",
            params![dao_id],
        )
    }

    async fn proposal(&self, proposal_id: &str) -> GovernanceResult<Option<Proposal>> {
        let conn = self.conn.lock().await;
        load_one(&conn, "SELECT body FROM proposals WHERE id = ?1", params![proposal_id])
    }

    async fn proposals(&self, filter: &RecordFilter<ProposalStatus>) -> GovernanceResult<Vec<Proposal>> {
        let conn = self.conn.lock().await;
        load_many(
            &conn,
            "SELECT body FROM proposals
             WHERE (?1 IS NULL OR dao_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at, id",
            params![filter.dao_id, filter.status.map(|s| s.as_str())],
        )
    }

    async fn votes(&self, proposal_id: &str) -> GovernanceResult<Vec<Vote>> {
        let conn = self.conn.lock().await;
        load_many(
            &conn,
            "SELECT body FROM votes WHERE proposal_id = ?1 ORDER BY cast_at, voter",
            params![proposal_id],
        )
    }

    async fn funding_request(&self, request_id: &str) -> GovernanceResult<Option<FundingRequest>> {
        let conn = self.conn.lock().await;
        load_one(
            &conn,
            "SELECT body FROM funding_requests WHERE id = ?1",
            params![request_id],
        )
    }

    async fn funding_requests(
        &self,
        filter: &RecordFilter<FundingStatus>,
    ) -> GovernanceResult<Vec<FundingRequest>> {
        let conn = self.conn.lock().await;
        load_many(
            &conn,
            "SELECT body FROM funding_requests
             WHERE (?1 IS NULL OR dao_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at, id",
            params![filter.dao_id, filter.status.map(|s| s.as_str())],
        )
    }

    async fn milestone(&self, milestone_id: &str) -> GovernanceResult<Option<MilestoneVerification>> {
        let conn = self.conn.lock().await;
        load_one(&conn, "SELECT body FROM milestones WHERE id = ?1", params![milestone_id])
    }

    async fn milestones(
        &self,
        filter: &RecordFilter<MilestoneStatus>,
    ) -> GovernanceResult<Vec<MilestoneVerification>> {
        let conn = self.conn.lock().await;
        load_many(
            &conn,
            "SELECT body FROM milestones
             WHERE (?1 IS NULL OR dao_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at, id",
            params![filter.dao_id, filter.status.map(|s| s.as_str())],
        )
    }

    async fn transactions(&self, dao_id: &str) -> GovernanceResult<Vec<TreasuryTransaction>> {
        let conn = self.conn.lock().await;
        load_many(
            &conn,
            "SELECT body FROM treasury_transactions WHERE dao_id = ?1 ORDER BY seq",
            params![dao_id],
        )
    }

    async fn investments(&self, dao_id: &str) -> GovernanceResult<Vec<InvestmentAllocation>> {
        let conn = self.conn.lock().await;
        load_many(
            &conn,
            "SELECT body FROM investments WHERE dao_id = ?1 ORDER BY seq",
            params![dao_id],
        )
    }

    async fn commit(&self, ops: Vec<StoreOp>) -> GovernanceResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let count = ops.len();

        for op in ops {
            let name = op.name();
            // Dropping `tx` on error rolls the batch back
            apply_op(&tx, op).map_err(|e| {
                debug!("Commit aborted at {}: {}", name, e);
                e
            })?;
        }

        tx.commit()?;
        debug!("Committed {} store operations", count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DaoParameters, MemberRole};
    use chrono::Utc;

    fn member(dao_id: &str, user: &str, role: MemberRole) -> DaoMember {
        let now = Utc::now();
        DaoMember {
            user_id: user.to_string(),
            dao_id: dao_id.to_string(),
            role,
            voting_power: 100,
            contribution_score: 0,
            joined_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_dao_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let mut dao = Dao::new("Helium Builders", DaoParameters::default(), Utc::now());
        dao.treasury_balance = 750;
        let dao_id = dao.id.clone();

        store.commit(vec![StoreOp::PutDao(dao.clone())]).await.unwrap();

        assert_eq!(store.dao(&dao_id).await.unwrap(), Some(dao));
        assert!(store.dao("dao_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_rolls_back_on_failure() {
        let store = SqliteStore::in_memory().unwrap();
        let mut dao = Dao::new("Helium Builders", DaoParameters::default(), Utc::now());
        dao.treasury_balance = 100;
        let dao_id = dao.id.clone();
        store.commit(vec![StoreOp::PutDao(dao)]).await.unwrap();

        let result = store
            .commit(vec![
                StoreOp::PutMember(member(&dao_id, "alice", MemberRole::Admin)),
                StoreOp::DebitTreasury {
                    dao_id: dao_id.clone(),
                    amount: 500,
                },
            ])
            .await;

        assert_eq!(
            result,
            Err(GovernanceError::InsufficientTreasury { need: 500, have: 100 })
        );
        assert!(store.members(&dao_id).await.unwrap().is_empty());
        assert_eq!(store.dao(&dao_id).await.unwrap().unwrap().treasury_balance, 100);
    }

    #[tokio::test]
    async fn test_member_upsert_and_remove() {
        let store = SqliteStore::in_memory().unwrap();

        store
            .commit(vec![StoreOp::PutMember(member("dao_1", "bob", MemberRole::Member))])
            .await
            .unwrap();
        store
            .commit(vec![StoreOp::PutMember(member("dao_1", "bob", MemberRole::Council))])
            .await
            .unwrap();

        let members = store.members("dao_1").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].role, MemberRole::Council);

        store
            .commit(vec![StoreOp::RemoveMember {
                dao_id: "dao_1".to_string(),
                user_id: "bob".to_string(),
            }])
            .await
            .unwrap();
        assert!(store.member("dao_1", "bob").await.unwrap().is_none());
    }
}
