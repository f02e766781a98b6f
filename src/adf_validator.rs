use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use std::sync::OnceLock;

use crate::adf_models::{Customer, NormalizedLead, Vehicle, VehicleInterest, VehicleStatus, Vendor};
use crate::adf_parser::XmlNode;
use crate::errors::AppError;

pub const MIN_VEHICLE_YEAR: i32 = 1900;

/// Checks a parsed ADF tree and produces the normalized lead.
#[derive(Debug, Clone)]
pub struct AdfValidator {
    phone_region: CountryId,
}

impl Default for AdfValidator {
    fn default() -> Self {
        Self {
            phone_region: CountryId::US,
        }
    }
}

impl AdfValidator {
    pub fn new(phone_region: CountryId) -> Self {
        Self { phone_region }
    }

    pub fn validate(&self, root: &XmlNode) -> Result<NormalizedLead, AppError> {
        self.validate_at(root, Utc::now())
    }

    /// Validates against `now`, which bounds the plausible vehicle year.
    pub fn validate_at(&self, root: &XmlNode, now: DateTime<Utc>) -> Result<NormalizedLead, AppError> {
        let prospect = find_prospect(root)?;

        let request_date = prospect
            .child_text("requestdate")
            .ok_or_else(|| AppError::validation("prospect.requestdate", "is required"))
            .and_then(parse_request_date)?;

        let customer_node = prospect
            .child("customer")
            .ok_or_else(|| AppError::validation("prospect.customer", "is required"))?;
        let comments = customer_node.child_text("comments").map(str::to_string);

        let vehicle = match prospect.child("vehicle") {
            Some(node) => Some(validate_vehicle(node, now.year())?),
            None if comments.is_some() => None,
            None => {
                return Err(AppError::validation(
                    "prospect.vehicle",
                    "a vehicle or a customer inquiry (comments) is required",
                ))
            }
        };

        let customer = self.validate_customer(customer_node)?;
        let vendor = prospect.child("vendor").map(extract_vendor);

        let external_id = prospect.child_text("id").map(str::to_string);

        Ok(NormalizedLead {
            request_date,
            vehicle,
            customer,
            vendor,
            external_id,
            comments,
        })
    }

    fn validate_customer(&self, customer: &XmlNode) -> Result<Customer, AppError> {
        let contact = customer
            .child("contact")
            .ok_or_else(|| AppError::validation("customer.contact", "is required"))?;

        let (first_name, last_name) = extract_name(contact)?;

        let email = match contact.child_text("email") {
            Some(raw) if is_valid_email(raw) => Some(raw.to_lowercase()),
            Some(_) => {
                return Err(AppError::validation(
                    "customer.contact.email",
                    "is not a valid email address",
                ))
            }
            None => None,
        };

        let phone_node = contact.children_named("phone").find(|p| p.text().is_some());
        let phone = match phone_node.and_then(|p| p.text()) {
            Some(raw) => Some(normalize_phone(raw, self.phone_region).ok_or_else(|| {
                AppError::validation("customer.contact.phone", "is not a valid phone number")
            })?),
            None => None,
        };

        if email.is_none() && phone.is_none() {
            return Err(AppError::validation(
                "customer.contact",
                "at least one contact channel (email or phone) is required",
            ));
        }

        Ok(Customer {
            first_name,
            last_name,
            email,
            phone,
            phone_type: phone_node.and_then(|p| p.attr("type")).map(|t| t.trim().to_lowercase()),
            phone_time_preference: phone_node
                .and_then(|p| p.attr("time"))
                .map(|t| t.trim().to_lowercase()),
        })
    }
}

fn find_prospect(root: &XmlNode) -> Result<&XmlNode, AppError> {
    if root.is("prospect") {
        return Ok(root);
    }
    if !root.is("adf") {
        return Err(AppError::validation(
            "adf",
            format!("unexpected root element <{}>", root.name),
        ));
    }

    let mut prospects = root.children_named("prospect");
    let prospect = prospects
        .next()
        .ok_or_else(|| AppError::validation("adf.prospect", "is required"))?;
    if prospects.next().is_some() {
        return Err(AppError::validation(
            "adf.prospect",
            "exactly one prospect per document is supported",
        ));
    }
    Ok(prospect)
}

/// Parses ADF `requestdate`, trying ISO 8601 with offset first.
pub fn parse_request_date(raw: &str) -> Result<DateTime<Utc>, AppError> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // No offset given: assume UTC
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .map_err(|_| {
            AppError::validation(
                "prospect.requestdate",
                format!("'{}' is not a valid ISO 8601 timestamp", raw),
            )
        })
}

/// A four-digit model year between 1900 and two years past `current_year`.
pub fn parse_vehicle_year(raw: &str, current_year: i32) -> Result<i32, AppError> {
    let raw = raw.trim();
    if raw.len() != 4 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::validation(
            "vehicle.year",
            format!("'{}' is not a four-digit year", raw),
        ));
    }
    let year: i32 = raw
        .parse()
        .map_err(|_| AppError::validation("vehicle.year", "is not a number"))?;

    let max_year = current_year + 2;
    if !(MIN_VEHICLE_YEAR..=max_year).contains(&year) {
        return Err(AppError::validation(
            "vehicle.year",
            format!("{} is outside {}..={}", year, MIN_VEHICLE_YEAR, max_year),
        ));
    }
    Ok(year)
}

fn validate_vehicle(node: &XmlNode, current_year: i32) -> Result<Vehicle, AppError> {
    let year = node
        .child_text("year")
        .ok_or_else(|| AppError::validation("vehicle.year", "is required"))
        .and_then(|raw| parse_vehicle_year(raw, current_year))?;
    let make = node
        .child_text("make")
        .ok_or_else(|| AppError::validation("vehicle.make", "is required"))?;
    let model = node
        .child_text("model")
        .ok_or_else(|| AppError::validation("vehicle.model", "is required"))?;

    let interest_type = match node.attr("interest") {
        Some(raw) => raw
            .parse::<VehicleInterest>()
            .map_err(|e| AppError::validation("vehicle.interest", e))?,
        None => VehicleInterest::default(),
    };
    let status = match node.attr("status") {
        Some(raw) => raw
            .parse::<VehicleStatus>()
            .map_err(|e| AppError::validation("vehicle.status", e))?,
        None => VehicleStatus::default(),
    };

    Ok(Vehicle {
        year,
        make: make.to_string(),
        model: model.to_string(),
        trim: node.child_text("trim").map(str::to_string),
        interest_type,
        status,
    })
}

fn extract_name(contact: &XmlNode) -> Result<(Option<String>, Option<String>), AppError> {
    let mut first = None;
    let mut last = None;
    let mut full = None;

    for name in contact.children_named("name") {
        let Some(text) = name.text() else { continue };
        match name.attr("part").map(|p| p.trim().to_ascii_lowercase()).as_deref() {
            Some("first") => first = Some(text.to_string()),
            Some("last") => last = Some(text.to_string()),
            Some("middle") | Some("suffix") => {}
            _ => full = Some(text.to_string()),
        }
    }

    if first.is_none() && last.is_none() {
        if let Some(full) = full {
            let mut parts = full.splitn(2, char::is_whitespace);
            first = parts.next().map(str::to_string);
            last = parts
                .next()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
        }
    }

    if first.is_none() && last.is_none() {
        return Err(AppError::validation("customer.contact.name", "is required"));
    }
    Ok((first, last))
}

fn extract_vendor(node: &XmlNode) -> Vendor {
    let contact_name = node.child("contact").and_then(|contact| {
        let parts: Vec<&str> = contact
            .children_named("name")
            .filter_map(|n| n.text())
            .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    });

    Vendor {
        name: node.child_text("vendorname").map(str::to_string),
        contact_name,
    }
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .expect("email regex is valid")
    })
}

pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 254 && email_regex().is_match(email.trim())
}

/// Parses `raw` in `region` and formats it as E.164.
///
/// Numbers libphonenumber cannot place (fictional 555 exchanges, new area
/// codes) are still accepted if they carry 7 to 15 digits.
pub fn normalize_phone(raw: &str, region: CountryId) -> Option<String> {
    let digits = raw.chars().filter(|c| c.is_ascii_digit()).count();
    if !(7..=15).contains(&digits) {
        return None;
    }

    match phonenumber::parse(Some(region), raw) {
        Ok(number) => {
            if !phonenumber::is_valid(&number) {
                tracing::debug!("Phone '{}' parsed but is not a known allocation", raw);
            }
            Some(number.format().mode(Mode::E164).to_string())
        }
        Err(e) => {
            tracing::debug!("Failed to parse phone '{}': {:?}", raw, e);
            None
        }
    }
}
