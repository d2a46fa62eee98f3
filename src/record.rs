//! Reconstructed card records.

use std::fmt;

use clap::ValueEnum;

use crate::prelude::*;

/// How the relative named on a card is related to the voter.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
pub enum RelationType {
    Father,
    Husband,
    Mother,
    Other,
    /// No relation line was recognized.
    #[default]
    #[serde(rename = "")]
    Unknown,
}

impl RelationType {
    /// The label used in exports. Empty when unknown.
    pub fn as_str(self) -> &'static str {
        match self {
            RelationType::Father => "Father",
            RelationType::Husband => "Husband",
            RelationType::Mother => "Mother",
            RelationType::Other => "Other",
            RelationType::Unknown => "",
        }
    }
}

/// Gender printed on a card.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
pub enum Gender {
    Female,
    Male,
    #[serde(rename = "Third Gender")]
    ThirdGender,
    #[default]
    #[serde(rename = "")]
    Unknown,
}

impl Gender {
    /// The label used in exports. Empty when unknown.
    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Female => "Female",
            Gender::Male => "Male",
            Gender::ThirdGender => "Third Gender",
            Gender::Unknown => "",
        }
    }
}

/// The optional fields we track completeness for.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
    ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Field {
    VoterId,
    Name,
    RelationName,
    HouseNo,
    Age,
    Gender,
}

impl Field {
    /// Every tracked field, in export order.
    pub const ALL: [Field; 6] = [
        Field::VoterId,
        Field::Name,
        Field::RelationName,
        Field::HouseNo,
        Field::Age,
        Field::Gender,
    ];

    /// Can this field be read from the lower band of a card alone?
    pub fn in_lower_band(self) -> bool {
        matches!(self, Field::Age | Field::Gender)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::VoterId => "voter_id",
            Field::Name => "name",
            Field::RelationName => "relation_name",
            Field::HouseNo => "house_no",
            Field::Age => "age",
            Field::Gender => "gender",
        };
        f.write_str(name)
    }
}

/// Field values extracted from one card. Missing values are empty, never
/// absent, so every record exports the same columns.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct CardFields {
    /// The serial number printed on the card itself, if we could read it.
    pub printed_serial: String,
    pub voter_id: String,
    pub name: String,
    pub relation_type: RelationType,
    pub relation_name: String,
    pub house_no: String,
    /// Age in years, already checked against the plausible range.
    pub age: String,
    pub gender: Gender,
}

impl CardFields {
    /// Is `field` filled in?
    pub fn has(&self, field: Field) -> bool {
        match field {
            Field::VoterId => !self.voter_id.is_empty(),
            Field::Name => !self.name.is_empty(),
            Field::RelationName => !self.relation_name.is_empty(),
            Field::HouseNo => !self.house_no.is_empty(),
            Field::Age => !self.age.is_empty(),
            Field::Gender => self.gender != Gender::Unknown,
        }
    }

    /// Which of `fields` are still empty?
    pub fn missing(&self, fields: &[Field]) -> Vec<Field> {
        fields.iter().copied().filter(|&f| !self.has(f)).collect()
    }

    /// Copy every value we lack from `other`, leaving existing values alone.
    pub fn fill_missing_from(&mut self, other: &CardFields) {
        fill(&mut self.printed_serial, &other.printed_serial);
        fill(&mut self.voter_id, &other.voter_id);
        fill(&mut self.name, &other.name);
        if self.relation_name.is_empty() && !other.relation_name.is_empty() {
            self.relation_name = other.relation_name.clone();
            self.relation_type = other.relation_type;
        } else if self.relation_type == RelationType::Unknown {
            self.relation_type = other.relation_type;
        }
        fill(&mut self.house_no, &other.house_no);
        fill(&mut self.age, &other.age);
        if self.gender == Gender::Unknown {
            self.gender = other.gender;
        }
    }
}

fn fill(dest: &mut String, src: &str) {
    if dest.is_empty() && !src.is_empty() {
        *dest = src.to_owned();
    }
}

/// Output status of a record, mirroring how far extraction got.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Every tracked field was extracted.
    Ok,
    /// Some fields are completeness gaps.
    Incomplete,
    /// Recognition failed outright.
    Failed,
}

/// One entry in the record table.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RecordEntry {
    /// Position of the card within its source unit, starting at 1.
    pub serial: usize,
    /// Extracted fields, or `None` if recognition failed.
    pub fields: Option<CardFields>,
    /// Identifier of the source unit.
    pub source: String,
}

impl RecordEntry {
    /// How complete is this record?
    pub fn status(&self) -> RecordStatus {
        match &self.fields {
            None => RecordStatus::Failed,
            Some(fields) if fields.missing(&Field::ALL).is_empty() => RecordStatus::Ok,
            Some(_) => RecordStatus::Incomplete,
        }
    }

    /// Which tracked fields are missing? A failed record is missing all of
    /// them.
    pub fn missing_fields(&self) -> Vec<Field> {
        match &self.fields {
            None => Field::ALL.to_vec(),
            Some(fields) => fields.missing(&Field::ALL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_missing_keeps_existing_values() {
        let mut fields = CardFields {
            name: "Meena".to_owned(),
            ..CardFields::default()
        };
        let other = CardFields {
            name: "Wrong".to_owned(),
            age: "34".to_owned(),
            gender: Gender::Female,
            relation_type: RelationType::Husband,
            relation_name: "Kumar".to_owned(),
            ..CardFields::default()
        };
        fields.fill_missing_from(&other);
        assert_eq!(fields.name, "Meena");
        assert_eq!(fields.age, "34");
        assert_eq!(fields.gender, Gender::Female);
        assert_eq!(fields.relation_type, RelationType::Husband);
        assert_eq!(fields.relation_name, "Kumar");
    }

    #[test]
    fn status_tracks_completeness() {
        let mut entry = RecordEntry {
            serial: 1,
            fields: None,
            source: "unit".to_owned(),
        };
        assert_eq!(entry.status(), RecordStatus::Failed);
        assert_eq!(entry.missing_fields().len(), 6);

        let mut fields = CardFields {
            voter_id: "ABC1234567".to_owned(),
            name: "Meena".to_owned(),
            relation_name: "Kumar".to_owned(),
            house_no: "12".to_owned(),
            age: "34".to_owned(),
            ..CardFields::default()
        };
        entry.fields = Some(fields.clone());
        assert_eq!(entry.status(), RecordStatus::Incomplete);
        assert_eq!(entry.missing_fields(), vec![Field::Gender]);

        fields.gender = Gender::Female;
        entry.fields = Some(fields);
        assert_eq!(entry.status(), RecordStatus::Ok);
    }

    #[test]
    fn unknown_enums_serialize_as_empty_strings() {
        let json = serde_json::to_value(CardFields::default()).unwrap();
        assert_eq!(json["relation_type"], "");
        assert_eq!(json["gender"], "");
    }
}
