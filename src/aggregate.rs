//! Rebuild records from a flat list of positioned fragments.
//!
//! Pages hold cards in a fixed grid, and every card starts with exactly one
//! identifier. So each identifier fragment seeds a record, records in the
//! same column are stacked into a contiguous partition of that column, and
//! every other fragment joins the record whose vertical extent it falls in.

use std::{cmp::Ordering, sync::LazyLock};

use regex::Regex;

use crate::{
    config::LayoutConfig,
    fragments::{FieldLabel, Fragment},
    parser::{clean_text, parse_age, parse_card, resolve_gender},
    prelude::*,
    record::{CardFields, Gender},
};

static FIRST_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]+").expect("failed to compile regex"));

static EDGE_DASHES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s\-–]+|[\s\-–]+$").expect("failed to compile regex"));

/// The fragments making up one reconstructed record.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct FragmentGroup {
    pub page: usize,
    pub column: usize,
    /// Top of the record's vertical extent (inclusive).
    pub start: f64,
    /// Bottom of the record's vertical extent (exclusive).
    pub end: f64,
    /// The identifier fragment that seeded this record.
    pub anchor: Fragment,
    /// Every other fragment assigned to this record, sorted by `y`.
    pub members: Vec<Fragment>,
}

impl FragmentGroup {
    fn same_column(&self, page: usize, column: usize) -> bool {
        self.page == page && self.column == column
    }

    fn contains(&self, y: f64) -> bool {
        self.start <= y && y < self.end
    }

    /// Turn this group's fragments into field values.
    ///
    /// Labeled fragments fill their own field, first one wins. Unlabeled text
    /// is run through the card parser afterwards to fill whatever is still
    /// missing.
    pub fn to_fields(&self) -> CardFields {
        let mut fields = CardFields {
            voter_id: normalize_identifier(&self.anchor.text),
            ..CardFields::default()
        };
        let mut free_text = vec![];

        for fragment in &self.members {
            let text = strip_edge_dashes(&fragment.text);
            match fragment.label {
                FieldLabel::Identifier => fill(&mut fields.voter_id, normalize_identifier(&text)),
                FieldLabel::PrintedSerial => {
                    if let Some(digits) = FIRST_DIGITS.find(&text) {
                        fill(&mut fields.printed_serial, digits.as_str().to_owned());
                    }
                }
                FieldLabel::Name => fill(&mut fields.name, clean_text(&text)),
                FieldLabel::RelationName => fill(&mut fields.relation_name, clean_text(&text)),
                FieldLabel::HouseNo => fill(&mut fields.house_no, clean_text(&text)),
                FieldLabel::Age => {
                    if let Some(age) = FIRST_DIGITS
                        .find(&text)
                        .and_then(|digits| parse_age(digits.as_str()))
                    {
                        fill(&mut fields.age, age.to_string());
                    }
                }
                FieldLabel::Gender => {
                    if fields.gender == Gender::Unknown {
                        fields.gender = resolve_gender(&text);
                    }
                }
                FieldLabel::Text => free_text.push(fragment.text.as_str()),
            }
        }

        if !free_text.is_empty() {
            let parsed = parse_card(&free_text.join("\n"));
            fields.fill_missing_from(&parsed);
        }
        fields
    }
}

fn fill(dest: &mut String, value: String) {
    if dest.is_empty() {
        *dest = value;
    }
}

fn strip_edge_dashes(text: &str) -> String {
    EDGE_DASHES.replace_all(text, "").into_owned()
}

fn normalize_identifier(text: &str) -> String {
    strip_edge_dashes(text)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// Order groups by page, then column, then top edge.
fn group_order(a: &FragmentGroup, b: &FragmentGroup) -> Ordering {
    (a.page, a.column)
        .cmp(&(b.page, b.column))
        .then(a.start.total_cmp(&b.start))
}

/// Partition the fragments of one source unit into records.
///
/// Records come back sorted by page, column and vertical position, which is
/// also the order their serial numbers are assigned in. Fragments on a
/// (page, column) with no identifier at all are dropped.
pub fn partition_fragments(
    fragments: Vec<Fragment>,
    layout: &LayoutConfig,
) -> Vec<FragmentGroup> {
    let (anchors, others): (Vec<_>, Vec<_>) = fragments
        .into_iter()
        .partition(|f| f.label == FieldLabel::Identifier);

    let mut groups = anchors
        .into_iter()
        .map(|anchor| FragmentGroup {
            page: anchor.page,
            column: layout.column_of(anchor.x),
            start: anchor.y,
            end: anchor.y + layout.anchor_span,
            anchor,
            members: vec![],
        })
        .collect::<Vec<_>>();
    groups.sort_by(group_order);

    // Each record ends where the next one in its column begins.
    for i in 1..groups.len() {
        let (page, column, next_start) = (groups[i].page, groups[i].column, groups[i].start);
        let prev = &mut groups[i - 1];
        if prev.same_column(page, column) {
            prev.end = next_start;
        }
    }

    let mut dropped = 0usize;
    for fragment in others {
        let column = layout.column_of(fragment.x);
        match assign_group(&groups, fragment.page, column, fragment.y, layout.anchor_tolerance)
        {
            Some(idx) => groups[idx].members.push(fragment),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        warn!(dropped, "Dropped fragments in columns without any identifier");
    }

    for group in &mut groups {
        group.members.sort_by(|a, b| a.y.total_cmp(&b.y));
    }
    groups
}

/// Pick the group for a fragment at `y`: the group whose extent contains it,
/// else the last group (in sorted order) starting strictly within
/// `tolerance`, else the group with the nearest start. Only groups on the
/// same page and column are considered.
fn assign_group(
    groups: &[FragmentGroup],
    page: usize,
    column: usize,
    y: f64,
    tolerance: f64,
) -> Option<usize> {
    let candidates = groups
        .iter()
        .enumerate()
        .filter(|(_, g)| g.same_column(page, column))
        .collect::<Vec<_>>();

    if let Some((idx, _)) = candidates.iter().find(|(_, g)| g.contains(y)) {
        return Some(*idx);
    }
    if let Some((idx, _)) = candidates
        .iter()
        .rev()
        .find(|(_, g)| (g.start - y).abs() < tolerance)
    {
        return Some(*idx);
    }
    candidates
        .iter()
        .min_by(|(_, a), (_, b)| (a.start - y).abs().total_cmp(&(b.start - y).abs()))
        .map(|(idx, _)| *idx)
}
