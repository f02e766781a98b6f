use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

/// ADF `vehicle@interest`. Absent attribute means `buy` per the ADF standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VehicleInterest {
    #[default]
    Buy,
    Lease,
    Sell,
    TradeIn,
    TestDrive,
}

impl VehicleInterest {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleInterest::Buy => "buy",
            VehicleInterest::Lease => "lease",
            VehicleInterest::Sell => "sell",
            VehicleInterest::TradeIn => "trade-in",
            VehicleInterest::TestDrive => "test-drive",
        }
    }
}

impl FromStr for VehicleInterest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(VehicleInterest::Buy),
            "lease" => Ok(VehicleInterest::Lease),
            "sell" => Ok(VehicleInterest::Sell),
            "trade-in" => Ok(VehicleInterest::TradeIn),
            "test-drive" => Ok(VehicleInterest::TestDrive),
            other => Err(format!("unknown vehicle interest '{}'", other)),
        }
    }
}

impl fmt::Display for VehicleInterest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ADF `vehicle@status`. Absent attribute means `new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VehicleStatus {
    #[default]
    New,
    Used,
}

impl VehicleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleStatus::New => "new",
            VehicleStatus::Used => "used",
        }
    }
}

impl FromStr for VehicleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(VehicleStatus::New),
            "used" => Ok(VehicleStatus::Used),
            other => Err(format!("unknown vehicle status '{}'", other)),
        }
    }
}

impl fmt::Display for VehicleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub year: i32,
    pub make: String,
    pub model: String,
    pub trim: Option<String>,
    pub interest_type: VehicleInterest,
    pub status: VehicleStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Lowercased.
    pub email: Option<String>,
    /// E.164.
    pub phone: Option<String>,
    pub phone_type: Option<String>,
    pub phone_time_preference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vendor {
    pub name: Option<String>,
    pub contact_name: Option<String>,
}

/// Document fields after validation, before ingestion metadata is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedLead {
    pub request_date: DateTime<Utc>,
    pub vehicle: Option<Vehicle>,
    pub customer: Customer,
    pub vendor: Option<Vendor>,
    /// Vendor-supplied `prospect/id`.
    pub external_id: Option<String>,
    pub comments: Option<String>,
}

/// Where and how a document arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestMetadata {
    pub source_ip: IpAddr,
    pub received_at: DateTime<Utc>,
    pub raw_size_bytes: usize,
    /// Hex SHA-256 of the raw request body.
    pub raw_sha256: String,
    pub source: String,
    pub dealership_id: Option<i64>,
}

/// A validated lead ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAdfLead {
    pub lead: NormalizedLead,
    pub metadata: IngestMetadata,
}

/// A persisted lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdfLead {
    pub id: Uuid,
    #[serde(flatten)]
    pub lead: NormalizedLead,
    #[serde(flatten)]
    pub metadata: IngestMetadata,
}

impl AdfLead {
    pub fn from_new(id: Uuid, new_lead: NewAdfLead) -> Self {
        Self {
            id,
            lead: new_lead.lead,
            metadata: new_lead.metadata,
        }
    }
}

/// JSON envelope accepted on `application/json` submissions.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadEnvelope {
    pub xml_content: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub dealership_id: Option<i64>,
}

/// Response body for a created lead.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadCreatedResponse {
    pub lead_id: Uuid,
}
