use async_trait::async_trait;
use chrono::{DateTime, Utc};
use failsafe::futures::CircuitBreaker;
use sqlx::PgPool;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::adf_models::{
    AdfLead, Customer, IngestMetadata, NewAdfLead, NormalizedLead, Vehicle, Vendor,
};
use crate::circuit_breaker::{create_db_circuit_breaker, StorageCircuitBreaker};
use crate::errors::{is_constraint_violation, AppError};

/// Persistence for ingested leads. Leads are insert-only.
#[async_trait]
pub trait LeadRepository: Send + Sync {
    /// Writes one lead atomically and returns its generated id.
    async fn insert(&self, lead: &NewAdfLead) -> Result<Uuid, AppError>;

    async fn find(&self, id: Uuid) -> Result<Option<AdfLead>, AppError>;
}

/// Postgres-backed repository.
pub struct PgLeadRepository {
    pool: PgPool,
    breaker: StorageCircuitBreaker,
}

impl PgLeadRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            breaker: create_db_circuit_breaker(),
        }
    }
}

#[async_trait]
impl LeadRepository for PgLeadRepository {
    async fn insert(&self, new_lead: &NewAdfLead) -> Result<Uuid, AppError> {
        let pool = self.pool.clone();
        let lead = &new_lead.lead;
        let meta = &new_lead.metadata;
        let vehicle = lead.vehicle.as_ref();
        let vendor = lead.vendor.as_ref();
        let raw_size = i32::try_from(meta.raw_size_bytes)
            .map_err(|_| AppError::validation("rawSizeBytes", "exceeds storable range"))?;

        let write = async move {
            let mut tx = pool.begin().await?;

            let id: Uuid = sqlx::query_scalar(
                r#"
                INSERT INTO adf_leads (
                    request_date,
                    vehicle_year, vehicle_make, vehicle_model, vehicle_trim,
                    vehicle_interest, vehicle_status,
                    customer_first_name, customer_last_name, customer_email, customer_phone,
                    customer_phone_type, customer_phone_time,
                    vendor_name, vendor_contact_name,
                    external_id, comments, source, dealership_id,
                    source_ip, received_at, raw_size_bytes, raw_sha256
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                        $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
                RETURNING id
                "#,
            )
            .bind(lead.request_date)
            .bind(vehicle.map(|v| v.year))
            .bind(vehicle.map(|v| v.make.as_str()))
            .bind(vehicle.map(|v| v.model.as_str()))
            .bind(vehicle.and_then(|v| v.trim.as_deref()))
            .bind(vehicle.map(|v| v.interest_type.as_str()))
            .bind(vehicle.map(|v| v.status.as_str()))
            .bind(lead.customer.first_name.as_deref())
            .bind(lead.customer.last_name.as_deref())
            .bind(lead.customer.email.as_deref())
            .bind(lead.customer.phone.as_deref())
            .bind(lead.customer.phone_type.as_deref())
            .bind(lead.customer.phone_time_preference.as_deref())
            .bind(vendor.and_then(|v| v.name.as_deref()))
            .bind(vendor.and_then(|v| v.contact_name.as_deref()))
            .bind(lead.external_id.as_deref())
            .bind(lead.comments.as_deref())
            .bind(&meta.source)
            .bind(meta.dealership_id)
            .bind(meta.source_ip.to_string())
            .bind(meta.received_at)
            .bind(raw_size)
            .bind(&meta.raw_sha256)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok::<Uuid, sqlx::Error>(id)
        };

        // Constraint violations are bad rows, not a sick database.
        let result = self
            .breaker
            .call_with(|e: &sqlx::Error| !is_constraint_violation(e), write)
            .await;

        match result {
            Ok(id) => {
                tracing::debug!("Stored ADF lead {}", id);
                Ok(id)
            }
            Err(failsafe::Error::Inner(e)) => Err(AppError::from(e)),
            Err(failsafe::Error::Rejected) => Err(AppError::StorageUnavailable(
                "circuit breaker open for lead storage".to_string(),
            )),
        }
    }

    async fn find(&self, id: Uuid) -> Result<Option<AdfLead>, AppError> {
        let row = sqlx::query_as::<_, AdfLeadRow>(
            r#"
            SELECT id, request_date,
                   vehicle_year, vehicle_make, vehicle_model, vehicle_trim,
                   vehicle_interest, vehicle_status,
                   customer_first_name, customer_last_name, customer_email, customer_phone,
                   customer_phone_type, customer_phone_time,
                   vendor_name, vendor_contact_name,
                   external_id, comments, source, dealership_id,
                   source_ip, received_at, raw_size_bytes, raw_sha256
            FROM adf_leads
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AdfLead::try_from).transpose()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AdfLeadRow {
    id: Uuid,
    request_date: DateTime<Utc>,
    vehicle_year: Option<i32>,
    vehicle_make: Option<String>,
    vehicle_model: Option<String>,
    vehicle_trim: Option<String>,
    vehicle_interest: Option<String>,
    vehicle_status: Option<String>,
    customer_first_name: Option<String>,
    customer_last_name: Option<String>,
    customer_email: Option<String>,
    customer_phone: Option<String>,
    customer_phone_type: Option<String>,
    customer_phone_time: Option<String>,
    vendor_name: Option<String>,
    vendor_contact_name: Option<String>,
    external_id: Option<String>,
    comments: Option<String>,
    source: String,
    dealership_id: Option<i64>,
    source_ip: String,
    received_at: DateTime<Utc>,
    raw_size_bytes: i32,
    raw_sha256: String,
}

impl TryFrom<AdfLeadRow> for AdfLead {
    type Error = AppError;

    fn try_from(row: AdfLeadRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str| {
            AppError::InternalError(format!("adf_leads row {} has invalid {}", row.id, what))
        };

        let vehicle = match (row.vehicle_year, &row.vehicle_make, &row.vehicle_model) {
            (Some(year), Some(make), Some(model)) => Some(Vehicle {
                year,
                make: make.clone(),
                model: model.clone(),
                trim: row.vehicle_trim.clone(),
                interest_type: row
                    .vehicle_interest
                    .as_deref()
                    .unwrap_or("buy")
                    .parse()
                    .map_err(|_| corrupt("vehicle_interest"))?,
                status: row
                    .vehicle_status
                    .as_deref()
                    .unwrap_or("new")
                    .parse()
                    .map_err(|_| corrupt("vehicle_status"))?,
            }),
            (None, None, None) => None,
            _ => return Err(corrupt("vehicle columns")),
        };

        let vendor = if row.vendor_name.is_some() || row.vendor_contact_name.is_some() {
            Some(Vendor {
                name: row.vendor_name.clone(),
                contact_name: row.vendor_contact_name.clone(),
            })
        } else {
            None
        };

        let source_ip: IpAddr = row.source_ip.parse().map_err(|_| corrupt("source_ip"))?;
        let raw_size_bytes =
            usize::try_from(row.raw_size_bytes).map_err(|_| corrupt("raw_size_bytes"))?;

        Ok(AdfLead {
            id: row.id,
            lead: NormalizedLead {
                request_date: row.request_date,
                vehicle,
                customer: Customer {
                    first_name: row.customer_first_name,
                    last_name: row.customer_last_name,
                    email: row.customer_email,
                    phone: row.customer_phone,
                    phone_type: row.customer_phone_type,
                    phone_time_preference: row.customer_phone_time,
                },
                vendor,
                external_id: row.external_id,
                comments: row.comments,
            },
            metadata: IngestMetadata {
                source_ip,
                received_at: row.received_at,
                raw_size_bytes,
                raw_sha256: row.raw_sha256,
                source: row.source,
                dealership_id: row.dealership_id,
            },
        })
    }
}

/// Process-local repository for tests and database-less runs.
#[derive(Default)]
pub struct InMemoryLeadRepository {
    leads: RwLock<HashMap<Uuid, AdfLead>>,
    unavailable: AtomicBool,
}

impl InMemoryLeadRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent writes fail with `StorageUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.leads.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.leads.read().await.is_empty()
    }
}

#[async_trait]
impl LeadRepository for InMemoryLeadRepository {
    async fn insert(&self, lead: &NewAdfLead) -> Result<Uuid, AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::StorageUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        if lead.lead.customer.email.is_none() && lead.lead.customer.phone.is_none() {
            return Err(AppError::validation(
                "adf_leads_contact_channel",
                "rejected by storage constraint",
            ));
        }

        let id = Uuid::new_v4();
        self.leads
            .write()
            .await
            .insert(id, AdfLead::from_new(id, lead.clone()));
        Ok(id)
    }

    async fn find(&self, id: Uuid) -> Result<Option<AdfLead>, AppError> {
        Ok(self.leads.read().await.get(&id).cloned())
    }
}
