//! Buyer and card field validation.
//!
//! Every validator collects all problems into [`FieldErrors`] rather than
//! stopping at the first, so a form can show them all at once. Field keys
//! use the camelCase names of the form fields.

use crate::error::FieldErrors;
use crate::types::{BuyerInfo, BuyerInfoForm, CardDetails, PhoneNumber};
use chrono::{DateTime, Datelike, Utc};

/// Longest accepted first or last name
pub const MAX_NAME_LENGTH: usize = 50;

/// Longest accepted email address
pub const MAX_EMAIL_LENGTH: usize = 255;

const MIN_PHONE_DIGITS: usize = 8;
const MAX_PHONE_DIGITS: usize = 15;

// Calling code → ISO 3166-1 alpha-2. Matched by longest prefix.
const CALLING_CODES: &[(&str, &str)] = &[
    ("1", "US"),
    ("7", "RU"),
    ("27", "ZA"),
    ("31", "NL"),
    ("32", "BE"),
    ("33", "FR"),
    ("34", "ES"),
    ("39", "IT"),
    ("41", "CH"),
    ("43", "AT"),
    ("44", "GB"),
    ("45", "DK"),
    ("46", "SE"),
    ("47", "NO"),
    ("48", "PL"),
    ("49", "DE"),
    ("52", "MX"),
    ("55", "BR"),
    ("61", "AU"),
    ("64", "NZ"),
    ("65", "SG"),
    ("81", "JP"),
    ("86", "CN"),
    ("91", "IN"),
    ("351", "PT"),
    ("353", "IE"),
    ("358", "FI"),
    ("971", "AE"),
];

/// Validates and normalizes the buyer form
///
/// # Errors
///
/// Returns every field problem found.
pub fn validate_buyer_info(form: &BuyerInfoForm) -> Result<BuyerInfo, FieldErrors> {
    let mut errors = FieldErrors::new();

    let first_name = validate_name(&form.first_name, "firstName", "First name", &mut errors);
    let last_name = validate_name(&form.last_name, "lastName", "Last name", &mut errors);

    let email = form.email.trim().to_lowercase();
    if email.is_empty() {
        errors.add("email", "Email is required");
    } else if !is_valid_email(&email) {
        errors.add("email", "Please enter a valid email address");
    }

    let phone = match normalize_phone(&form.phone) {
        Ok(phone) => Some(phone),
        Err(message) => {
            errors.add("phone", message);
            None
        },
    };

    match (errors.is_empty(), phone) {
        (true, Some(phone)) => Ok(BuyerInfo {
            first_name,
            last_name,
            email,
            phone,
        }),
        _ => Err(errors),
    }
}

fn validate_name(raw: &str, field: &str, label: &str, errors: &mut FieldErrors) -> String {
    let name = raw.trim();
    if name.is_empty() {
        errors.add(field, format!("{label} is required"));
    } else if name.chars().count() > MAX_NAME_LENGTH {
        errors.add(
            field,
            format!("{label} must be at most {MAX_NAME_LENGTH} characters"),
        );
    }
    name.to_string()
}

/// Checks an email address for a plausible `local@domain.tld` shape
///
/// ```
/// use boxoffice_checkout::validation::is_valid_email;
///
/// assert!(is_valid_email("buyer+tickets@example.com"));
/// assert!(!is_valid_email("buyer@localhost"));
/// ```
#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || email.len() > MAX_EMAIL_LENGTH {
        return false;
    }

    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return false;
    }

    let valid_local = |c: char| c.is_alphanumeric() || matches!(c, '.' | '-' | '+' | '_');
    let valid_domain = |c: char| c.is_alphanumeric() || matches!(c, '.' | '-');
    if !local.chars().all(valid_local) || !domain.chars().all(valid_domain) {
        return false;
    }

    // Every label non-empty, at least two of them
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|label| !label.is_empty())
}

/// Normalizes a phone number to E.164
///
/// Spaces, dashes, dots and parentheses are dropped and a leading `00` is
/// read as `+`. The country comes from the longest matching calling code.
///
/// # Errors
///
/// Returns a message for the buyer when the number is missing, lacks a
/// country code, or has the wrong number of digits.
pub fn normalize_phone(raw: &str) -> Result<PhoneNumber, String> {
    let compact: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();

    if compact.is_empty() {
        return Err("Phone number is required".to_string());
    }

    let digits = if let Some(rest) = compact.strip_prefix('+') {
        rest
    } else if let Some(rest) = compact.strip_prefix("00") {
        rest
    } else {
        return Err("Include the country code, e.g. +1 555 123 4567".to_string());
    };

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err("Phone number may only contain digits".to_string());
    }
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
        return Err(format!(
            "Phone number must have between {MIN_PHONE_DIGITS} and {MAX_PHONE_DIGITS} digits"
        ));
    }

    Ok(PhoneNumber {
        e164: format!("+{digits}"),
        country: detect_country(digits).map(str::to_string),
    })
}

fn detect_country(digits: &str) -> Option<&'static str> {
    CALLING_CODES
        .iter()
        .filter(|(code, _)| digits.starts_with(code))
        .max_by_key(|(code, _)| code.len())
        .map(|(_, country)| *country)
}

/// Validates card details against `now` (for the expiry check)
///
/// # Errors
///
/// Returns every field problem found.
pub fn validate_card(card: &CardDetails, now: DateTime<Utc>) -> Result<(), FieldErrors> {
    let mut errors = FieldErrors::new();

    if card.holder_name.trim().is_empty() {
        errors.add("holderName", "Cardholder name is required");
    }

    let number_ok = card
        .number
        .chars()
        .all(|c| c.is_ascii_digit() || c == ' ' || c == '-');
    let digits = card.digits();
    if digits.is_empty() {
        errors.add("number", "Card number is required");
    } else if !number_ok || !(12..=19).contains(&digits.len()) || !passes_luhn(&digits) {
        errors.add("number", "Card number is invalid");
    }

    if !(1..=12).contains(&card.exp_month) {
        errors.add("expMonth", "Expiry month must be between 1 and 12");
    } else if (card.exp_year, card.exp_month) < (now.year(), now.month()) {
        errors.add("expYear", "Card has expired");
    }

    let cvc = card.cvc.trim();
    if !(3..=4).contains(&cvc.len()) || !cvc.chars().all(|c| c.is_ascii_digit()) {
        errors.add("cvc", "Security code must be 3 or 4 digits");
    }

    errors.into_result(())
}

/// Luhn checksum over a string of ASCII digits
#[must_use]
pub fn passes_luhn(digits: &str) -> bool {
    let mut sum = 0u32;
    for (i, c) in digits.chars().rev().enumerate() {
        let Some(mut d) = c.to_digit(10) else {
            return false;
        };
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    !digits.is_empty() && sum % 10 == 0
}
