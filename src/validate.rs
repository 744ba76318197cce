use crate::schedule::PickupTime;

/// Kenyan country calling code used for canonical guardian phone numbers.
pub const COUNTRY_CODE: &str = "254";

/// Normalize a raw phone number to `+254XXXXXXXXX`.
///
/// Strips everything but digits, swaps a leading national trunk `0` for the
/// country code, prepends the country code when it is absent, then adds the
/// `+`. Idempotent on already-canonical input; a raw number with an odd
/// prefix combination can still come out wrong and is caught by
/// `validate_phone` afterwards.
pub fn format_phone_number(raw: &str) -> String {
    let mut cleaned: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if let Some(rest) = cleaned.strip_prefix('0') {
        cleaned = format!("{}{}", COUNTRY_CODE, rest);
    }
    if !cleaned.starts_with(COUNTRY_CODE) {
        cleaned = format!("{}{}", COUNTRY_CODE, cleaned);
    }

    format!("+{}", cleaned)
}

/// Strict canonical form: `+254` followed by exactly nine digits.
pub fn validate_phone(phone: &str) -> bool {
    match phone.strip_prefix('+').and_then(|p| p.strip_prefix(COUNTRY_CODE)) {
        Some(subscriber) => subscriber.len() == 9 && subscriber.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Strict zero-padded 24-hour `HH:MM`.
pub fn validate_time(time: &str) -> bool {
    PickupTime::parse(time).is_some()
}

pub fn validate_admission_no(admission_no: &str) -> bool {
    !admission_no.trim().is_empty()
}

pub fn validate_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || local.contains(char::is_whitespace) {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => {
            !host.is_empty()
                && !tld.is_empty()
                && !domain.contains('@')
                && !domain.contains(char::is_whitespace)
        }
        None => false,
    }
}

/// Split a class label like `Grade 4 Blue` into its grade and stream against
/// the configured grade names. The longest matching grade prefix wins; the
/// trimmed remainder is the stream. A label matching no configured grade is
/// returned whole with no stream.
pub fn parse_class_label(label: &str, grades: &[String]) -> (String, Option<String>) {
    let trimmed = label.trim();
    let lower = trimmed.to_ascii_lowercase();

    let mut best: Option<&str> = None;
    for grade in grades {
        let g = grade.trim();
        if g.is_empty() {
            continue;
        }
        if lower.starts_with(&g.to_ascii_lowercase())
            && best.map(|b| g.len() > b.len()).unwrap_or(true)
        {
            best = Some(g);
        }
    }

    match best {
        Some(grade) => {
            let stream = trimmed[grade.len()..].trim();
            (
                trimmed[..grade.len()].to_string(),
                if stream.is_empty() {
                    None
                } else {
                    Some(stream.to_string())
                },
            )
        }
        None => (trimmed.to_string(), None),
    }
}
