use axum::body::Bytes;

use crate::adf_models::LeadEnvelope;
use crate::errors::AppError;

pub const RAW_XML_SOURCE: &str = "adf_xml";
pub const ENVELOPE_SOURCE: &str = "json_envelope";
const MAX_SOURCE_LEN: usize = 100;

/// A request body, decoded by content type before any XML is touched.
#[derive(Debug, Clone)]
pub enum AdfSubmission {
    Xml(Bytes),
    Envelope(LeadEnvelope),
}

/// Caller-supplied context that travels with the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestContext {
    pub source: String,
    pub dealership_id: Option<i64>,
}

#[derive(Debug, PartialEq, Eq)]
enum BodyKind {
    Xml,
    Json,
}

fn kind_from_content_type(content_type: &str) -> Option<BodyKind> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "application/xml" | "text/xml" => Some(BodyKind::Xml),
        "application/json" => Some(BodyKind::Json),
        m if m.starts_with("application/") && m.ends_with("+xml") => Some(BodyKind::Xml),
        m if m.starts_with("application/") && m.ends_with("+json") => Some(BodyKind::Json),
        _ => None,
    }
}

fn sniff(body: &[u8]) -> Option<BodyKind> {
    let first = body.iter().find(|b| !b.is_ascii_whitespace())?;
    match first {
        b'<' => Some(BodyKind::Xml),
        b'{' => Some(BodyKind::Json),
        _ => None,
    }
}

impl AdfSubmission {
    /// Picks the variant from `Content-Type`, sniffing the body when the header is absent.
    pub fn decode(content_type: Option<&str>, body: Bytes) -> Result<Self, AppError> {
        let kind = match content_type.map(str::trim).filter(|ct| !ct.is_empty()) {
            Some(ct) => kind_from_content_type(ct)
                .ok_or_else(|| AppError::MalformedInput(format!("unsupported content type '{}'", ct)))?,
            None => sniff(&body).ok_or_else(|| {
                AppError::MalformedInput("body is neither XML nor a JSON envelope".to_string())
            })?,
        };

        match kind {
            BodyKind::Xml => Ok(AdfSubmission::Xml(body)),
            BodyKind::Json => {
                let envelope: LeadEnvelope = serde_json::from_slice(&body)
                    .map_err(|e| AppError::MalformedInput(format!("invalid JSON envelope: {}", e)))?;
                Ok(AdfSubmission::Envelope(envelope))
            }
        }
    }

    /// Splits into the XML document bytes and the ingest context.
    pub fn into_parts(self) -> Result<(Vec<u8>, IngestContext), AppError> {
        match self {
            AdfSubmission::Xml(body) => Ok((
                body.to_vec(),
                IngestContext {
                    source: RAW_XML_SOURCE.to_string(),
                    dealership_id: None,
                },
            )),
            AdfSubmission::Envelope(envelope) => {
                if envelope.xml_content.trim().is_empty() {
                    return Err(AppError::MalformedInput(
                        "JSON envelope has an empty xmlContent".to_string(),
                    ));
                }

                let source = match envelope.source.as_deref().map(str::trim) {
                    Some(s) if s.chars().count() > MAX_SOURCE_LEN => {
                        return Err(AppError::validation(
                            "source",
                            format!("must be at most {} characters", MAX_SOURCE_LEN),
                        ))
                    }
                    Some(s) if !s.is_empty() => s.to_string(),
                    _ => ENVELOPE_SOURCE.to_string(),
                };

                Ok((
                    envelope.xml_content.into_bytes(),
                    IngestContext {
                        source,
                        dealership_id: envelope.dealership_id,
                    },
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xml_content_types() {
        for ct in ["application/xml", "text/xml; charset=utf-8", "application/adf+xml"] {
            let sub = AdfSubmission::decode(Some(ct), Bytes::from_static(b"<adf/>")).unwrap();
            assert!(matches!(sub, AdfSubmission::Xml(_)), "{}", ct);
        }
    }

    #[test]
    fn test_json_envelope() {
        let body = Bytes::from_static(
            br#"{"xmlContent": "<adf/>", "source": "test_api", "dealershipId": 12}"#,
        );
        let sub = AdfSubmission::decode(Some("application/json"), body).unwrap();
        let (xml, ctx) = sub.into_parts().unwrap();
        assert_eq!(xml, b"<adf/>");
        assert_eq!(ctx.source, "test_api");
        assert_eq!(ctx.dealership_id, Some(12));
    }

    #[test]
    fn test_envelope_defaults_source() {
        let body = Bytes::from_static(br#"{"xmlContent": "<adf/>"}"#);
        let (_, ctx) = AdfSubmission::decode(Some("application/json"), body)
            .unwrap()
            .into_parts()
            .unwrap();
        assert_eq!(ctx.source, ENVELOPE_SOURCE);
    }

    #[test]
    fn test_envelope_without_xml_content_is_malformed() {
        let err = AdfSubmission::decode(
            Some("application/json"),
            Bytes::from_static(br#"{"source": "x"}"#),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::MalformedInput(_)));

        let err = AdfSubmission::decode(
            Some("application/json"),
            Bytes::from_static(br#"{"xmlContent": "  "}"#),
        )
        .unwrap()
        .into_parts()
        .unwrap_err();
        assert!(matches!(err, AppError::MalformedInput(_)));
    }

    #[test]
    fn test_sniffs_without_content_type() {
        let xml = AdfSubmission::decode(None, Bytes::from_static(b"  \n<adf/>")).unwrap();
        assert!(matches!(xml, AdfSubmission::Xml(_)));

        let json =
            AdfSubmission::decode(None, Bytes::from_static(br#"{"xmlContent":"<adf/>"}"#)).unwrap();
        assert!(matches!(json, AdfSubmission::Envelope(_)));

        assert!(AdfSubmission::decode(None, Bytes::from_static(b"hello")).is_err());
    }

    #[test]
    fn test_unsupported_content_type() {
        let err = AdfSubmission::decode(Some("text/plain"), Bytes::from_static(b"<adf/>"))
            .unwrap_err();
        assert!(matches!(err, AppError::MalformedInput(_)));
    }
}
