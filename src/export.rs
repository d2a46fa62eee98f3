//! Writing the record table as CSV, plus completeness statistics.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer,
    prelude::*,
    record::{Field, RecordEntry, RecordStatus},
};

/// Part-number patterns for roll file names, most specific first.
static PART_NUMBER_PATTERNS: LazyLock<[Regex; 4]> = LazyLock::new(|| {
    [
        r"-TAM-([0-9]+)-WI",
        r"-([0-9]+)-WI$",
        r"([0-9]+)[^0-9]*WI",
        r"-([0-9]+)$",
    ]
    .map(|pattern| Regex::new(pattern).expect("failed to compile regex"))
});

/// Pull the part (polling booth) number out of a roll's file name.
pub fn extract_part_number(unit_id: &str) -> Option<String> {
    PART_NUMBER_PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(unit_id))
        .map(|caps| caps[1].to_owned())
}

/// One exported row. Field order here is column order.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ExportRow {
    /// The serial printed on the card, or the card's position in its unit.
    pub serial: String,
    pub part_no: String,
    pub voter_id: String,
    pub name: String,
    pub relation_type: String,
    pub relation_name: String,
    pub house_no: String,
    pub age: String,
    pub gender: String,
    /// The source unit the card came from.
    pub source: String,
    pub status: RecordStatus,
    /// Tracked fields left empty, separated by `;`.
    pub missing_fields: String,
}

impl ExportRow {
    pub fn from_entry(entry: &RecordEntry) -> Self {
        let fields = entry.fields.clone().unwrap_or_default();
        let serial = if fields.printed_serial.is_empty() {
            entry.serial.to_string()
        } else {
            fields.printed_serial.clone()
        };
        let missing_fields = entry
            .missing_fields()
            .iter()
            .map(Field::to_string)
            .collect::<Vec<_>>()
            .join(";");
        Self {
            serial,
            part_no: extract_part_number(&entry.source).unwrap_or_default(),
            voter_id: fields.voter_id,
            name: fields.name,
            relation_type: fields.relation_type.as_str().to_owned(),
            relation_name: fields.relation_name,
            house_no: fields.house_no,
            age: fields.age,
            gender: fields.gender.as_str().to_owned(),
            source: entry.source.clone(),
            status: entry.status(),
            missing_fields,
        }
    }
}

/// Completeness statistics for a finished record table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExportStats {
    pub total: usize,
    /// Records where recognition failed outright.
    pub failed: usize,
    /// Missing count per tracked field.
    pub missing: BTreeMap<Field, usize>,
}

impl ExportStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a RecordEntry>) -> Self {
        let mut stats = ExportStats::default();
        for entry in records {
            stats.total += 1;
            if entry.fields.is_none() {
                stats.failed += 1;
            }
            for field in entry.missing_fields() {
                *stats.missing.entry(field).or_default() += 1;
            }
        }
        stats
    }

    pub fn missing(&self, field: Field) -> usize {
        self.missing.get(&field).copied().unwrap_or(0)
    }

    /// Percentage of records with both age and gender, judged by whichever
    /// of the two is missing more often.
    pub fn completeness_percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        let worst = self.missing(Field::Age).max(self.missing(Field::Gender));
        (self.total - worst) as f64 * 100.0 / self.total as f64
    }
}

/// Write `records` as CSV to `path`, in index order.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn write_csv<'a>(
    path: &Path,
    records: impl IntoIterator<Item = &'a RecordEntry>,
) -> Result<usize> {
    let wtr = create_writer(Some(path)).await?;
    let mut csv = csv_async::AsyncSerializer::from_writer(wtr);
    let mut count = 0;
    for entry in records {
        csv.serialize(ExportRow::from_entry(entry))
            .await
            .context("failed to write CSV row")?;
        count += 1;
    }
    let mut wtr = csv
        .into_inner()
        .await
        .map_err(|err| anyhow!("failed to flush CSV: {}", err))?;
    wtr.flush().await.context("failed to flush CSV")?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CardFields, Gender, RelationType};

    #[test]
    fn part_numbers_come_from_file_names() {
        let cases = [
            ("2025-EROLLGEN-S22-114-SIR-FinalRoll-Revision1-TAM-123-WI", Some("123")),
            ("ac114-part-45-WI", Some("45")),
            ("part7WI", Some("7")),
            ("booth-88", Some("88")),
            ("no digits here", None),
        ];
        for (name, expected) in cases {
            assert_eq!(extract_part_number(name).as_deref(), expected, "{name}");
        }
    }

    fn entries() -> Vec<RecordEntry> {
        vec![
            RecordEntry {
                serial: 1,
                fields: Some(CardFields {
                    printed_serial: "101".to_owned(),
                    voter_id: "ABC1234567".to_owned(),
                    name: "முருகன்".to_owned(),
                    relation_type: RelationType::Father,
                    relation_name: "ராமசாமி".to_owned(),
                    house_no: "4".to_owned(),
                    age: "45".to_owned(),
                    gender: Gender::Male,
                }),
                source: "roll-TAM-12-WI".to_owned(),
            },
            RecordEntry {
                serial: 2,
                fields: Some(CardFields {
                    name: "Meena".to_owned(),
                    gender: Gender::Female,
                    ..CardFields::default()
                }),
                source: "roll-TAM-12-WI".to_owned(),
            },
            RecordEntry {
                serial: 3,
                fields: None,
                source: "roll-TAM-12-WI".to_owned(),
            },
        ]
    }

    #[test]
    fn stats_use_the_worse_of_age_and_gender() {
        let stats = ExportStats::from_records(&entries());
        assert_eq!(stats.total, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.missing(Field::Age), 2);
        assert_eq!(stats.missing(Field::Gender), 1);
        assert!((stats.completeness_percent() - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(ExportStats::default().completeness_percent(), 100.0);
    }

    #[tokio::test]
    async fn writes_one_row_per_record() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("export")?;
        let path = dir.path().join("out/roll.csv");
        let count = write_csv(&path, &entries()).await?;
        assert_eq!(count, 3);

        let csv = tokio::fs::read_to_string(&path).await?;
        let lines = csv.lines().collect::<Vec<_>>();
        assert_eq!(
            lines[0],
            "serial,part_no,voter_id,name,relation_type,relation_name,house_no,age,gender,source,status,missing_fields"
        );
        assert_eq!(
            lines[1],
            "101,12,ABC1234567,முருகன்,Father,ராமசாமி,4,45,Male,roll-TAM-12-WI,ok,"
        );
        assert_eq!(
            lines[2],
            "2,12,,Meena,,,,,Female,roll-TAM-12-WI,incomplete,voter_id;relation_name;house_no;age"
        );
        assert!(lines[3].starts_with("3,12,,,,,,,,roll-TAM-12-WI,failed,voter_id;name;"));
        Ok(())
    }
}
