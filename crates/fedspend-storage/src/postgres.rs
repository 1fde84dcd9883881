use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedspend_core::{EntityKind, NaturalKey, NormalizedRecord, StoredRecord};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Connection, Postgres, Row, Transaction};
use tracing::debug;

use crate::{RecordStore, StoreError, StoreTransaction};

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(config: &PgStoreConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PostgresStore {
    async fn begin(&self, kind: EntityKind) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx, kind }))
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
    kind: EntityKind,
}

impl PgTransaction {
    /// Every statement runs inside a savepoint so one failing record does not abort the
    /// surrounding transaction.
    async fn savepoint(&mut self) -> Result<Transaction<'_, Postgres>, StoreError> {
        let conn: &mut PgConnection = &mut self.tx;
        Ok(Connection::begin(conn).await?)
    }
}

fn stored_from_row(row: &PgRow) -> Result<StoredRecord, StoreError> {
    Ok(StoredRecord {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_write_error(err: sqlx::Error, key: &NaturalKey) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Duplicate(key.to_string())
        }
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn find_by_natural_key(
        &mut self,
        key: &NaturalKey,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let query = match key {
            NaturalKey::Award { award_id } => sqlx::query(
                "SELECT id, created_at, updated_at FROM awards WHERE award_id = $1",
            )
            .bind(award_id),
            NaturalKey::ContractOpportunity { opportunity_id } => sqlx::query(
                "SELECT id, created_at, updated_at FROM contract_opportunities WHERE opportunity_id = $1",
            )
            .bind(opportunity_id),
            NaturalKey::Subaward { subaward_id } => sqlx::query(
                "SELECT id, created_at, updated_at FROM subawards WHERE subaward_id = $1",
            )
            .bind(subaward_id),
            NaturalKey::EconomicIndicator { series_id, date } => sqlx::query(
                "SELECT id, created_at, updated_at FROM economic_indicators WHERE series_id = $1 AND date = $2",
            )
            .bind(series_id)
            .bind(*date),
            NaturalKey::CompanyFiling {
                cik,
                filing_type,
                filing_date,
            } => sqlx::query(
                "SELECT id, created_at, updated_at FROM company_filings WHERE cik = $1 AND filing_type = $2 AND filing_date = $3",
            )
            .bind(cik)
            .bind(filing_type)
            .bind(*filing_date),
        };

        let mut sp = self.savepoint().await?;
        let row = query.fetch_optional(&mut *sp).await?;
        sp.commit().await?;
        row.as_ref().map(stored_from_row).transpose()
    }

    async fn insert(
        &mut self,
        record: &NormalizedRecord,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let key = record.natural_key();
        let mut sp = self.savepoint().await?;

        let id: i64 = match record {
            NormalizedRecord::Award(a) => sqlx::query_scalar(
                "INSERT INTO awards (award_id, description, award_amount, recipient_name, recipient_uei, \
                 awarding_agency, funding_agency, award_type, start_date, end_date, recipient_state, \
                 raw_data, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13) RETURNING id",
            )
            .bind(&a.award_id)
            .bind(&a.description)
            .bind(a.award_amount)
            .bind(&a.recipient_name)
            .bind(&a.recipient_uei)
            .bind(&a.awarding_agency)
            .bind(&a.funding_agency)
            .bind(&a.award_type)
            .bind(a.start_date)
            .bind(a.end_date)
            .bind(&a.recipient_state)
            .bind(&a.raw_data)
            .bind(now)
            .fetch_one(&mut *sp)
            .await
            .map_err(|e| map_write_error(e, &key))?,
            NormalizedRecord::ContractOpportunity(o) => sqlx::query_scalar(
                "INSERT INTO contract_opportunities (opportunity_id, title, description, agency, status, \
                 posted_date, response_deadline, estimated_value, place_of_performance, naics_code, \
                 set_aside, raw_data, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13) RETURNING id",
            )
            .bind(&o.opportunity_id)
            .bind(&o.title)
            .bind(&o.description)
            .bind(&o.agency)
            .bind(&o.status)
            .bind(o.posted_date)
            .bind(o.response_deadline)
            .bind(o.estimated_value)
            .bind(&o.place_of_performance)
            .bind(&o.naics_code)
            .bind(&o.set_aside)
            .bind(&o.raw_data)
            .bind(now)
            .fetch_one(&mut *sp)
            .await
            .map_err(|e| map_write_error(e, &key))?,
            NormalizedRecord::Subaward(s) => sqlx::query_scalar(
                "INSERT INTO subawards (subaward_id, prime_award_id, recipient_name, recipient_address, \
                 amount, description, place_of_performance, period_of_performance_start, \
                 period_of_performance_end, raw_data, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11) RETURNING id",
            )
            .bind(&s.subaward_id)
            .bind(&s.prime_award_id)
            .bind(&s.recipient_name)
            .bind(&s.recipient_address)
            .bind(s.amount)
            .bind(&s.description)
            .bind(&s.place_of_performance)
            .bind(s.period_of_performance_start)
            .bind(s.period_of_performance_end)
            .bind(&s.raw_data)
            .bind(now)
            .fetch_one(&mut *sp)
            .await
            .map_err(|e| map_write_error(e, &key))?,
            NormalizedRecord::EconomicIndicator(p) => sqlx::query_scalar(
                "INSERT INTO economic_indicators (series_id, date, value, indicator_type, units, \
                 seasonally_adjusted, raw_data, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) RETURNING id",
            )
            .bind(&p.series_id)
            .bind(p.date)
            .bind(p.value)
            .bind(&p.indicator_type)
            .bind(&p.units)
            .bind(&p.seasonally_adjusted)
            .bind(&p.raw_data)
            .bind(now)
            .fetch_one(&mut *sp)
            .await
            .map_err(|e| map_write_error(e, &key))?,
            NormalizedRecord::CompanyFiling(f) => {
                let filing_id: i64 = sqlx::query_scalar(
                    "INSERT INTO company_filings (cik, company_name, filing_type, filing_date, \
                     accession_number, period_end_date, fiscal_year, fiscal_period, raw_data, \
                     created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10) RETURNING id",
                )
                .bind(&f.cik)
                .bind(&f.company_name)
                .bind(&f.filing_type)
                .bind(f.filing_date)
                .bind(&f.accession_number)
                .bind(f.period_end_date)
                .bind(f.fiscal_year)
                .bind(&f.fiscal_period)
                .bind(&f.raw_data)
                .bind(now)
                .fetch_one(&mut *sp)
                .await
                .map_err(|e| map_write_error(e, &key))?;

                for metric in &f.metrics {
                    sqlx::query(
                        "INSERT INTO company_financials (filing_id, metric_name, taxonomy, value, unit, \
                         start_date, end_date, raw_data, created_at, updated_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)",
                    )
                    .bind(filing_id)
                    .bind(&metric.metric_name)
                    .bind(&metric.taxonomy)
                    .bind(metric.value)
                    .bind(&metric.unit)
                    .bind(metric.start_date)
                    .bind(metric.end_date)
                    .bind(&metric.raw_data)
                    .bind(now)
                    .execute(&mut *sp)
                    .await?;
                }
                debug!(filing_id, metrics = f.metrics.len(), "inserted filing metrics");
                filing_id
            }
        };

        sp.commit().await?;
        Ok(id)
    }

    async fn update(
        &mut self,
        existing: &StoredRecord,
        record: &NormalizedRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = record.natural_key();
        let mut sp = self.savepoint().await?;

        let result = match record {
            NormalizedRecord::Award(a) => sqlx::query(
                "UPDATE awards SET description = $2, award_amount = $3, recipient_name = $4, \
                 recipient_uei = $5, awarding_agency = $6, funding_agency = $7, award_type = $8, \
                 start_date = $9, end_date = $10, recipient_state = $11, raw_data = $12, \
                 updated_at = $13 WHERE id = $1",
            )
            .bind(existing.id)
            .bind(&a.description)
            .bind(a.award_amount)
            .bind(&a.recipient_name)
            .bind(&a.recipient_uei)
            .bind(&a.awarding_agency)
            .bind(&a.funding_agency)
            .bind(&a.award_type)
            .bind(a.start_date)
            .bind(a.end_date)
            .bind(&a.recipient_state)
            .bind(&a.raw_data)
            .bind(now)
            .execute(&mut *sp)
            .await
            .map_err(|e| map_write_error(e, &key))?,
            NormalizedRecord::ContractOpportunity(o) => sqlx::query(
                "UPDATE contract_opportunities SET title = $2, description = $3, agency = $4, \
                 status = $5, posted_date = $6, response_deadline = $7, estimated_value = $8, \
                 place_of_performance = $9, naics_code = $10, set_aside = $11, raw_data = $12, \
                 updated_at = $13 WHERE id = $1",
            )
            .bind(existing.id)
            .bind(&o.title)
            .bind(&o.description)
            .bind(&o.agency)
            .bind(&o.status)
            .bind(o.posted_date)
            .bind(o.response_deadline)
            .bind(o.estimated_value)
            .bind(&o.place_of_performance)
            .bind(&o.naics_code)
            .bind(&o.set_aside)
            .bind(&o.raw_data)
            .bind(now)
            .execute(&mut *sp)
            .await
            .map_err(|e| map_write_error(e, &key))?,
            NormalizedRecord::Subaward(s) => sqlx::query(
                "UPDATE subawards SET prime_award_id = $2, recipient_name = $3, recipient_address = $4, \
                 amount = $5, description = $6, place_of_performance = $7, \
                 period_of_performance_start = $8, period_of_performance_end = $9, raw_data = $10, \
                 updated_at = $11 WHERE id = $1",
            )
            .bind(existing.id)
            .bind(&s.prime_award_id)
            .bind(&s.recipient_name)
            .bind(&s.recipient_address)
            .bind(s.amount)
            .bind(&s.description)
            .bind(&s.place_of_performance)
            .bind(s.period_of_performance_start)
            .bind(s.period_of_performance_end)
            .bind(&s.raw_data)
            .bind(now)
            .execute(&mut *sp)
            .await
            .map_err(|e| map_write_error(e, &key))?,
            NormalizedRecord::EconomicIndicator(p) => sqlx::query(
                "UPDATE economic_indicators SET value = $2, indicator_type = $3, units = $4, \
                 seasonally_adjusted = $5, raw_data = $6, updated_at = $7 WHERE id = $1",
            )
            .bind(existing.id)
            .bind(p.value)
            .bind(&p.indicator_type)
            .bind(&p.units)
            .bind(&p.seasonally_adjusted)
            .bind(&p.raw_data)
            .bind(now)
            .execute(&mut *sp)
            .await
            .map_err(|e| map_write_error(e, &key))?,
            NormalizedRecord::CompanyFiling(f) => sqlx::query(
                "UPDATE company_filings SET company_name = $2, accession_number = $3, \
                 period_end_date = $4, fiscal_year = $5, fiscal_period = $6, raw_data = $7, \
                 updated_at = $8 WHERE id = $1",
            )
            .bind(existing.id)
            .bind(&f.company_name)
            .bind(&f.accession_number)
            .bind(f.period_end_date)
            .bind(f.fiscal_year)
            .bind(&f.fiscal_period)
            .bind(&f.raw_data)
            .bind(now)
            .execute(&mut *sp)
            .await
            .map_err(|e| map_write_error(e, &key))?,
        };

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: record.kind(),
                id: existing.id,
            });
        }
        sp.commit().await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let kind = self.kind;
        self.tx.commit().await.map_err(|e| StoreError::Commit {
            kind,
            message: e.to_string(),
        })
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
