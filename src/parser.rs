//! Field extraction from the recognized text of one card.
//!
//! Cards are printed in Tamil with a few English fragments. Each line is
//! matched against keyword rules; the identifier is found anywhere in the
//! text.

use std::sync::LazyLock;

use regex::Regex;

use crate::record::{CardFields, Gender, RelationType};

/// Youngest plausible voter.
pub const MIN_AGE: u32 = 18;
/// Oldest plausible voter.
pub const MAX_AGE: u32 = 120;

/// Identifiers are at least this long.
const MIN_VOTER_ID_LEN: usize = 9;

/// Largest number we accept as a printed serial.
const MAX_PRINTED_SERIAL: u32 = 2000;

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("failed to compile regex")
}

/// Identifier patterns, strictest first.
static VOTER_ID_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        regex(r"\b([A-Z]{2,3}[0-9]{6,10})\b"),
        regex(r"\b([A-Z0-9]{2,3}[0-9]{6,10})\b"),
    ]
});

static SERIAL_ALONE: LazyLock<Regex> = LazyLock::new(|| regex(r"^\s*([0-9]{1,4})\s*$"));
static SERIAL_LEADING: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^\s*([0-9]{1,4})\s+\S"));

static NAME_KEYWORD: LazyLock<Regex> = LazyLock::new(|| regex(r"பெயர்"));
static FATHER_LINE: LazyLock<Regex> =
    LazyLock::new(|| regex(r"(தந்தை|தந்தையின்).*பெயர்"));
static HUSBAND_LINE: LazyLock<Regex> = LazyLock::new(|| regex(r"(கணவர்|கணவரின்)"));
static MOTHER_LINE: LazyLock<Regex> = LazyLock::new(|| regex(r"(தாய்|தாயின்).*பெயர்"));
static OTHER_LINE: LazyLock<Regex> = LazyLock::new(|| regex(r"(இதரர்|இதரரின்).*பெயர்"));
static RELATION_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| regex(r"(தந்தை|கணவர்|கணவரின்|தாய்|தாயின்|இதரர்|இதரரின்)"));
static HOUSE_LINE: LazyLock<Regex> = LazyLock::new(|| regex(r"(வீட்டு|ட்டு)\s*எண்"));
static AGE_VALUE: LazyLock<Regex> = LazyLock::new(|| regex(r"வயது\s*:\s*([0-9]+)"));
static GENDER_LINE: LazyLock<Regex> = LazyLock::new(|| regex(r"பாலினம்"));

/// Cleanup substitutions, applied in order.
static CLEANUPS: LazyLock<[(Regex, &'static str); 4]> = LazyLock::new(|| {
    [
        (regex(r"(?i)\s*photo\s*is\s*"), " "),
        (regex(r"(?i)\s*available\s*"), " "),
        (regex(r"^[\s\-–.,:|]+|[\s\-–.,:|]+$"), ""),
        (regex(r"\s+"), " "),
    ]
});

/// Relation rules, in priority order.
static RELATION_RULES: LazyLock<[(&'static Regex, RelationType); 4]> =
    LazyLock::new(|| {
        [
            (&*FATHER_LINE, RelationType::Father),
            (&*HUSBAND_LINE, RelationType::Husband),
            (&*MOTHER_LINE, RelationType::Mother),
            (&*OTHER_LINE, RelationType::Other),
        ]
    });

/// Strip OCR boilerplate and stray punctuation from a field value.
pub fn clean_text(text: &str) -> String {
    let mut text = text.to_owned();
    for (pattern, replacement) in CLEANUPS.iter() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }
    text.trim().to_owned()
}

/// Everything after the first `:` on a line, cleaned up.
fn value_after_separator(line: &str) -> Option<String> {
    let (_, value) = line.split_once(':')?;
    let value = clean_text(value);
    (!value.is_empty()).then_some(value)
}

/// Parse an age, rejecting values outside the plausible range instead of
/// clamping them.
pub fn parse_age(digits: &str) -> Option<u32> {
    let age = digits.trim().parse::<u32>().ok()?;
    (MIN_AGE..=MAX_AGE).contains(&age).then_some(age)
}

/// Resolve gender keywords. Female is tested first, so text mentioning both
/// resolves to female.
pub fn resolve_gender(text: &str) -> Gender {
    let lower = text.to_lowercase();
    if text.contains("பெண") || lower.contains("female") {
        Gender::Female
    } else if text.contains("ஆண") || lower.contains("male") {
        Gender::Male
    } else if text.contains("திருநங்கை")
        || text.contains("மூன்றாம்")
        || lower.contains("third")
    {
        Gender::ThirdGender
    } else {
        Gender::Unknown
    }
}

/// Find the first identifier of plausible length anywhere in `text`.
pub fn find_voter_id(text: &str) -> Option<String> {
    VOTER_ID_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures_iter(text)
            .map(|caps| caps[1].to_owned())
            .find(|id| id.len() >= MIN_VOTER_ID_LEN)
    })
}

/// Find the serial number printed in the corner of a card.
fn find_printed_serial(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let caps = SERIAL_ALONE
            .captures(line)
            .or_else(|| SERIAL_LEADING.captures(line))?;
        let serial = caps[1].parse::<u32>().ok()?;
        (serial < MAX_PRINTED_SERIAL).then(|| serial.to_string())
    })
}

/// Extract every field we can from the recognized text of one card.
///
/// This never fails. Fields we can't find are left empty, and a card without
/// an identifier is still returned.
pub fn parse_card(text: &str) -> CardFields {
    let mut fields = CardFields::default();

    if let Some(id) = find_voter_id(text) {
        fields.voter_id = id;
    }
    if let Some(serial) = find_printed_serial(text) {
        fields.printed_serial = serial;
    }
    if let Some(caps) = AGE_VALUE.captures(text)
        && let Some(age) = parse_age(&caps[1])
    {
        fields.age = age.to_string();
    }

    for line in text.lines() {
        if !line.contains(':') {
            continue;
        }

        let is_relation_line = RELATION_KEYWORD.is_match(line);
        if fields.name.is_empty()
            && !is_relation_line
            && NAME_KEYWORD.is_match(line)
            && let Some(name) = value_after_separator(line)
        {
            fields.name = name;
            continue;
        }

        if is_relation_line {
            if fields.relation_name.is_empty()
                && let Some(kind) = RELATION_RULES
                    .iter()
                    .find(|(pattern, _)| pattern.is_match(line))
                    .map(|(_, kind)| *kind)
                && let Some(value) = value_after_separator(line)
            {
                fields.relation_type = kind;
                fields.relation_name = value;
            }
            continue;
        }

        if fields.house_no.is_empty()
            && HOUSE_LINE.is_match(line)
            && let Some(house) = value_after_separator(line)
        {
            fields.house_no = house;
            continue;
        }

        if fields.gender == Gender::Unknown && GENDER_LINE.is_match(line) {
            fields.gender = resolve_gender(line);
        }
    }

    fields
}
