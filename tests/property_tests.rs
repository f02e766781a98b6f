/// Property-based tests using proptest
/// Tests invariants that should hold for all inputs
use adf_lead_ingest::adf_parser::{contains_dtd, parse_document};
use adf_lead_ingest::adf_validator::{is_valid_email, normalize_phone, parse_vehicle_year, AdfValidator};
use adf_lead_ingest::errors::AppError;
use phonenumber::country::Id as CountryId;
use proptest::prelude::*;

// Property: parsing and validation never panic
proptest! {
    #[test]
    fn parser_never_panics(input in "\\PC*") {
        let _ = parse_document(input.as_bytes());
    }

    #[test]
    fn parser_never_panics_on_bytes(input in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = parse_document(&input);
    }

    #[test]
    fn validator_never_panics_on_parsed_trees(
        year in "[0-9]{0,6}",
        make in "[A-Za-z ]{0,12}",
        email in "[a-z@.]{0,16}",
        phone in "[0-9() -]{0,20}"
    ) {
        let xml = format!(
            "<adf><prospect><requestdate>2024-01-15T10:30:00Z</requestdate>\
             <vehicle><year>{}</year><make>{}</make><model>X</model></vehicle>\
             <customer><contact><name>Sam</name><email>{}</email><phone>{}</phone></contact></customer>\
             </prospect></adf>",
            year, make, email, phone
        );
        if let Ok(root) = parse_document(xml.as_bytes()) {
            let _ = AdfValidator::default().validate(&root);
        }
    }
}

// Property: any DOCTYPE or ENTITY declaration is refused as malformed input
proptest! {
    #[test]
    fn dtd_declarations_always_rejected(
        prefix in "[a-z ]{0,10}",
        keyword in prop::sample::select(vec!["DOCTYPE", "doctype", "DocType", "ENTITY", "entity"]),
        rest in "[a-zA-Z \"/:.]{0,30}"
    ) {
        let doc = format!("<adf>{}<!{} {}></adf>", prefix, keyword, rest);
        prop_assert!(contains_dtd(doc.as_bytes()));
        let rejected = matches!(parse_document(doc.as_bytes()), Err(AppError::MalformedInput(_)));
        prop_assert!(rejected);
    }
}

// Property: vehicle year bounds
proptest! {
    #[test]
    fn plausible_years_accepted(year in 1900i32..=2027) {
        prop_assert_eq!(parse_vehicle_year(&year.to_string(), 2025).unwrap(), year);
    }

    #[test]
    fn implausible_years_rejected(year in prop_oneof![1000i32..1900, 2028i32..=9999]) {
        prop_assert!(parse_vehicle_year(&year.to_string(), 2025).is_err());
    }

    #[test]
    fn non_four_digit_years_rejected(year in "[0-9]{1,3}|[0-9]{5,8}") {
        prop_assert!(parse_vehicle_year(&year, 2025).is_err());
    }
}

// Property: contact normalization
proptest! {
    #[test]
    fn email_validation_never_panics(email in "\\PC*") {
        let _ = is_valid_email(&email);
    }

    #[test]
    fn simple_emails_accepted(
        local in "[a-z][a-z0-9._]{0,15}",
        domain in "[a-z][a-z0-9]{1,15}",
        tld in "[a-z]{2,6}"
    ) {
        let email = format!("{}@{}.{}", local, domain, tld);
        prop_assert!(is_valid_email(&email), "rejected {}", email);
    }

    #[test]
    fn normalized_phones_are_e164(area in 201u32..=989, line in 2000000u32..=9999999) {
        let raw = format!("({}) {}-{}", area, line / 10000, line % 10000);
        if let Some(normalized) = normalize_phone(&raw, CountryId::US) {
            prop_assert!(normalized.starts_with('+'));
            prop_assert!(normalized[1..].chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn short_phones_rejected(phone in "[0-9]{0,6}") {
        prop_assert!(normalize_phone(&phone, CountryId::US).is_none());
    }
}
