//! Keep/delete selection over snapshot items.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::buckets;

/// Decision attached to an evaluated item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// The item survives this policy evaluation.
    Keep,
    /// The item is selected for deletion.
    Delete,
}

/// The six retention rules, one per bucket granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rule {
    /// Per-minute buckets.
    Minutes,
    /// Per-hour buckets.
    Hours,
    /// Per-day buckets.
    Days,
    /// Per-ISO-week buckets, Monday start.
    Weeks,
    /// Per-month buckets.
    Months,
    /// Per-year buckets.
    Years,
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Rule::Minutes => "minutes",
            Rule::Hours => "hours",
            Rule::Days => "days",
            Rule::Weeks => "weeks",
            Rule::Months => "months",
            Rule::Years => "years",
        };
        f.write_str(name)
    }
}

/// Why an item was kept or selected for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    /// Keep or delete.
    pub action: Action,
    /// The rule that decided, absent when no window considered the item.
    pub rule: Option<Rule>,
    /// The bucket key the item fell into.
    pub bucket: String,
    /// Position within the bucket, newest first, 1-based.
    pub rank: u32,
    /// Per-bucket cap the rule applied.
    pub cap: u32,
    /// Human note; "exceeds per-bucket cap" or "outside retention windows".
    pub note: String,
}

/// One snapshot as the engine sees it: an opaque id and its timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Opaque identifier, never dereferenced by the engine.
    pub item_id: String,
    /// Capture instant; bucketed by its UTC calendar regardless of the
    /// source locale.
    pub timestamp: DateTime<Utc>,
}

/// Retention criteria. A rule is active when its `keep_*` window is
/// positive; its cap is then `keep_per_*`, with values of zero coerced
/// to one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Criteria {
    /// Number of minute buckets in the window.
    pub keep_minutes: u32,
    /// Number of hour buckets in the window.
    pub keep_hours: u32,
    /// Number of day buckets in the window.
    pub keep_days: u32,
    /// Number of ISO-week buckets in the window.
    pub keep_weeks: u32,
    /// Number of month buckets in the window.
    pub keep_months: u32,
    /// Number of year buckets in the window.
    pub keep_years: u32,

    /// Items kept per minute bucket.
    pub keep_per_minute: u32,
    /// Items kept per hour bucket.
    pub keep_per_hour: u32,
    /// Items kept per day bucket.
    pub keep_per_day: u32,
    /// Items kept per ISO-week bucket.
    pub keep_per_week: u32,
    /// Items kept per month bucket.
    pub keep_per_month: u32,
    /// Items kept per year bucket.
    pub keep_per_year: u32,
}

impl Criteria {
    /// Whether no rule is active.
    pub fn is_empty(&self) -> bool {
        self.keep_minutes == 0
            && self.keep_hours == 0
            && self.keep_days == 0
            && self.keep_weeks == 0
            && self.keep_months == 0
            && self.keep_years == 0
    }
}

/// A policy evaluation anchored at a fixed `now`.
#[derive(Debug, Clone)]
pub struct Policy {
    criteria: Criteria,
    now: Option<DateTime<Utc>>,
}

impl Policy {
    /// Builds a policy with an explicit reference instant.
    pub fn new(criteria: Criteria, now: DateTime<Utc>) -> Self {
        Policy {
            criteria,
            now: Some(now),
        }
    }

    /// Builds a policy anchored at the UTC wall clock at selection time.
    pub fn with_wall_clock(criteria: Criteria) -> Self {
        Policy {
            criteria,
            now: None,
        }
    }

    /// The criteria this policy applies.
    pub fn criteria(&self) -> Criteria {
        self.criteria
    }

    /// The reference instant.
    pub fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    /// Partitions `items` into keep and delete with a reason per item.
    ///
    /// Input order is irrelevant; items are ranked newest-first inside
    /// each bucket with their id as a stable tiebreak. An item kept by any
    /// active rule is kept overall; the reported reason is the keep (or,
    /// failing that, delete) reason with the smallest rank across rules.
    pub fn select(&self, items: &[Item]) -> (BTreeSet<String>, BTreeMap<String, Reason>) {
        let now = self.now();

        let mut sorted: Vec<&Item> = items.iter().collect();
        sorted.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });

        let mut keep_reasons: HashMap<&str, Reason> = HashMap::with_capacity(items.len());
        let mut drop_reasons: HashMap<&str, Reason> = HashMap::with_capacity(items.len());

        let mut process_rule = |rule: Rule,
                                window: HashSet<String>,
                                key_fn: fn(DateTime<Utc>) -> String,
                                cap: u32| {
            if window.is_empty() {
                return;
            }
            let mut bucketed: BTreeMap<String, Vec<&Item>> = BTreeMap::new();
            for item in &sorted {
                let key = key_fn(item.timestamp);
                if window.contains(&key) {
                    bucketed.entry(key).or_default().push(item);
                }
            }
            for (bucket, members) in bucketed {
                for (idx, item) in members.iter().enumerate() {
                    let rank = idx as u32 + 1;
                    if rank <= cap {
                        let reason = Reason {
                            action: Action::Keep,
                            rule: Some(rule),
                            bucket: bucket.clone(),
                            rank,
                            cap,
                            note: String::new(),
                        };
                        match keep_reasons.get(item.item_id.as_str()) {
                            Some(prev) if prev.rank <= rank => {}
                            _ => {
                                keep_reasons.insert(item.item_id.as_str(), reason);
                            }
                        }
                    } else {
                        let reason = Reason {
                            action: Action::Delete,
                            rule: Some(rule),
                            bucket: bucket.clone(),
                            rank,
                            cap,
                            note: "exceeds per-bucket cap".to_string(),
                        };
                        match drop_reasons.get(item.item_id.as_str()) {
                            Some(prev) if prev.rank <= rank => {}
                            _ => {
                                drop_reasons.insert(item.item_id.as_str(), reason);
                            }
                        }
                    }
                }
            }
        };

        let c = self.criteria;
        if c.keep_minutes > 0 {
            process_rule(
                Rule::Minutes,
                buckets::last_n_minutes(now, c.keep_minutes),
                buckets::minute_key,
                buckets::cap_or_1(c.keep_per_minute),
            );
        }
        if c.keep_hours > 0 {
            process_rule(
                Rule::Hours,
                buckets::last_n_hours(now, c.keep_hours),
                buckets::hour_key,
                buckets::cap_or_1(c.keep_per_hour),
            );
        }
        if c.keep_days > 0 {
            process_rule(
                Rule::Days,
                buckets::last_n_days(now, c.keep_days),
                buckets::day_key,
                buckets::cap_or_1(c.keep_per_day),
            );
        }
        if c.keep_weeks > 0 {
            process_rule(
                Rule::Weeks,
                buckets::last_n_iso_weeks(now, c.keep_weeks),
                buckets::iso_week_key,
                buckets::cap_or_1(c.keep_per_week),
            );
        }
        if c.keep_months > 0 {
            process_rule(
                Rule::Months,
                buckets::last_n_months(now, c.keep_months),
                buckets::month_key,
                buckets::cap_or_1(c.keep_per_month),
            );
        }
        if c.keep_years > 0 {
            process_rule(
                Rule::Years,
                buckets::last_n_years(now, c.keep_years),
                buckets::year_key,
                buckets::cap_or_1(c.keep_per_year),
            );
        }

        let mut kept = BTreeSet::new();
        let mut reasons = BTreeMap::new();
        for item in &sorted {
            let id = item.item_id.as_str();
            if let Some(reason) = keep_reasons.remove(id) {
                kept.insert(id.to_string());
                reasons.insert(id.to_string(), reason);
            } else if let Some(reason) = drop_reasons.remove(id) {
                reasons.insert(id.to_string(), reason);
            } else {
                reasons.insert(
                    id.to_string(),
                    Reason {
                        action: Action::Delete,
                        rule: None,
                        bucket: String::new(),
                        rank: 0,
                        cap: 0,
                        note: "outside retention windows".to_string(),
                    },
                );
            }
        }
        (kept, reasons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn item(id: &str, t: DateTime<Utc>) -> Item {
        Item {
            item_id: id.to_string(),
            timestamp: t,
        }
    }

    #[test]
    fn test_daily_cap_one_keeps_newest_per_day() {
        let now = ts(2025, 8, 20, 12, 0);
        let mut items = Vec::new();
        let mut n = 0;
        for d in (16..=20).rev() {
            items.push(item(&format!("id{n:03}"), ts(2025, 8, d, 10, 1)));
            n += 1;
            items.push(item(&format!("id{n:03}"), ts(2025, 8, d, 10, 0)));
            n += 1;
        }

        let criteria = Criteria {
            keep_days: 3,
            keep_per_day: 1,
            ..Default::default()
        };
        let (keep, why) = Policy::new(criteria, now).select(&items);

        assert_eq!(keep.len(), 3);
        for id in ["id000", "id002", "id004"] {
            assert!(keep.contains(id), "missing {id}");
            let r = &why[id];
            assert_eq!(r.action, Action::Keep);
            assert_eq!(r.rule, Some(Rule::Days));
            assert_eq!(r.rank, 1);
            assert_eq!(r.cap, 1);
        }
        assert!(!keep.contains("id008"));
        assert_eq!(why["id008"].action, Action::Delete);
    }

    #[test]
    fn test_per_bucket_cap_two() {
        // S2: five items in the same minute, keep_days=1 cap 2
        let now = ts(2025, 8, 20, 12, 0);
        let items: Vec<Item> = (0..5)
            .map(|i| {
                Item {
                    item_id: format!("id{i:03}"),
                    timestamp: ts(2025, 8, 20, 10, 59) - chrono::Duration::seconds(i),
                }
            })
            .collect();

        let criteria = Criteria {
            keep_days: 1,
            keep_per_day: 2,
            ..Default::default()
        };
        let (keep, why) = Policy::new(criteria, now).select(&items);

        assert_eq!(keep.len(), 2);
        assert!(keep.contains("id000"));
        assert!(keep.contains("id001"));
        for (i, id) in ["id002", "id003", "id004"].iter().enumerate() {
            let r = &why[*id];
            assert_eq!(r.action, Action::Delete);
            assert_eq!(r.rule, Some(Rule::Days));
            assert_eq!(r.note, "exceeds per-bucket cap");
            assert_eq!(r.cap, 2);
            assert_eq!(r.rank, i as u32 + 3);
        }
    }

    #[test]
    fn test_union_across_rules() {
        // hour rule keeps A (top of the hour containing now); the minute
        // rule walks the 12:00 and 11:59 buckets and adds their tops
        let now = ts(2025, 8, 20, 12, 0);
        let items = vec![
            item("A", ts(2025, 8, 20, 12, 10)),
            item("B", ts(2025, 8, 20, 12, 0)),
            item("C", ts(2025, 8, 20, 11, 59)),
            item("D", ts(2025, 8, 20, 11, 5)),
        ];
        let criteria = Criteria {
            keep_hours: 1,
            keep_per_hour: 1,
            keep_minutes: 2,
            keep_per_minute: 1,
            ..Default::default()
        };
        let (keep, why) = Policy::new(criteria, now).select(&items);

        assert!(keep.contains("A"), "hour rule must keep A");
        assert!(keep.contains("B"), "minute rule must keep B");
        assert!(keep.len() >= 2, "union must keep at least A and B");
        // D sits inside the hour window but lost to A on the hour cap and
        // is outside every minute bucket
        assert!(!keep.contains("D"));
        assert_eq!(why["D"].action, Action::Delete);
    }

    #[test]
    fn test_union_is_exactly_the_union_of_single_rules() {
        let now = ts(2025, 8, 20, 12, 0);
        let items = vec![
            item("A", ts(2025, 8, 20, 12, 10)),
            item("B", ts(2025, 8, 20, 12, 0)),
            item("C", ts(2025, 8, 20, 11, 59)),
            item("D", ts(2025, 8, 20, 11, 5)),
        ];
        let hours_only = Criteria {
            keep_hours: 1,
            keep_per_hour: 1,
            ..Default::default()
        };
        let minutes_only = Criteria {
            keep_minutes: 2,
            keep_per_minute: 1,
            ..Default::default()
        };
        let both = Criteria {
            keep_hours: 1,
            keep_per_hour: 1,
            keep_minutes: 2,
            keep_per_minute: 1,
            ..Default::default()
        };

        let (keep_h, _) = Policy::new(hours_only, now).select(&items);
        let (keep_m, _) = Policy::new(minutes_only, now).select(&items);
        let (keep_union, _) = Policy::new(both, now).select(&items);

        let expected: BTreeSet<String> = keep_h.union(&keep_m).cloned().collect();
        assert_eq!(keep_union, expected);
    }

    #[test]
    fn test_outside_retention_windows() {
        let now = ts(2025, 8, 20, 12, 0);
        let items = vec![item("old", ts(2023, 8, 20, 12, 0))];
        let criteria = Criteria {
            keep_days: 1,
            keep_per_day: 1,
            ..Default::default()
        };
        let (keep, why) = Policy::new(criteria, now).select(&items);

        assert!(keep.is_empty());
        let r = &why["old"];
        assert_eq!(r.action, Action::Delete);
        assert_eq!(r.rule, None);
        assert_eq!(r.note, "outside retention windows");
    }

    #[test]
    fn test_iso_week_boundary_keeps_both() {
        // S3: Monday 2025-12-29 is ISO 2026-W01, the prior Sunday is 2025-W52
        let monday = ts(2025, 12, 29, 10, 0);
        let sunday = ts(2025, 12, 28, 10, 0);
        let items = vec![item("sun", sunday), item("mon", monday)];
        let criteria = Criteria {
            keep_weeks: 2,
            keep_per_week: 1,
            ..Default::default()
        };
        let (keep, why) = Policy::new(criteria, monday).select(&items);

        assert_eq!(keep.len(), 2);
        assert_ne!(why["sun"].bucket, why["mon"].bucket);
    }

    #[test]
    fn test_months_and_years_combined() {
        let now = ts(2025, 8, 20, 12, 0);
        let items = vec![
            item("m8", ts(2025, 8, 10, 0, 0)),
            item("m7", ts(2025, 7, 10, 0, 0)),
            item("m6", ts(2025, 6, 10, 0, 0)),
            item("y2024", ts(2024, 12, 31, 23, 59)),
        ];
        let criteria = Criteria {
            keep_months: 2,
            keep_per_month: 1,
            keep_years: 2,
            keep_per_year: 1,
            ..Default::default()
        };
        let (keep, why) = Policy::new(criteria, now).select(&items);

        assert!(keep.contains("m8"));
        assert!(keep.contains("m7"));
        assert!(keep.contains("y2024"));
        assert!(!keep.contains("m6"));
        assert_eq!(why["m7"].rule, Some(Rule::Months));
        assert_eq!(why["y2024"].rule, Some(Rule::Years));
    }

    #[test]
    fn test_zero_cap_coerced_to_one() {
        let now = ts(2025, 8, 20, 12, 0);
        let items = vec![
            item("a", ts(2025, 8, 20, 12, 10)),
            item("b", ts(2025, 8, 20, 12, 9)),
        ];
        let criteria = Criteria {
            keep_days: 1,
            keep_per_day: 0,
            ..Default::default()
        };
        let (keep, _) = Policy::new(criteria, now).select(&items);
        assert_eq!(keep.len(), 1);
        assert!(keep.contains("a"));
    }

    #[test]
    fn test_inactive_rule_ignores_cap() {
        let now = ts(2025, 8, 20, 12, 0);
        let items = vec![item("a", ts(2025, 8, 20, 12, 10))];
        // cap set but window inactive: the rule must not fire
        let criteria = Criteria {
            keep_per_day: 5,
            ..Default::default()
        };
        let (keep, why) = Policy::new(criteria, now).select(&items);
        assert!(keep.is_empty());
        assert_eq!(why["a"].note, "outside retention windows");
    }

    #[test]
    fn test_determinism() {
        let now = ts(2025, 8, 20, 12, 0);
        let items = vec![
            item("a", ts(2025, 8, 20, 11, 0)),
            item("b", ts(2025, 8, 19, 11, 0)),
        ];
        let criteria = Criteria {
            keep_days: 1,
            keep_per_day: 1,
            ..Default::default()
        };
        let (k1, r1) = Policy::new(criteria, now).select(&items);
        let (k2, r2) = Policy::new(criteria, now).select(&items);
        assert_eq!(k1, k2);
        assert_eq!(r1, r2);
    }

    #[test]
    fn test_utc_only_bucketing() {
        use chrono::FixedOffset;
        // 2025-08-20 01:30 +0300 is 2025-08-19 22:30 UTC: the bucket must
        // be the UTC day.
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        let local = offset.with_ymd_and_hms(2025, 8, 20, 1, 30, 0).unwrap();
        let utc: DateTime<Utc> = local.with_timezone(&Utc);

        let now = ts(2025, 8, 19, 23, 0);
        let items = vec![Item {
            item_id: "x".into(),
            timestamp: utc,
        }];
        let criteria = Criteria {
            keep_days: 1,
            keep_per_day: 1,
            ..Default::default()
        };
        let (_, why) = Policy::new(criteria, now).select(&items);
        assert_eq!(why["x"].bucket, "2025-08-19");
    }

    #[test]
    fn test_same_timestamp_tiebreak_is_stable() {
        let now = ts(2025, 8, 20, 12, 0);
        let t = ts(2025, 8, 20, 11, 0);
        let items = vec![item("b", t), item("a", t), item("c", t)];
        let criteria = Criteria {
            keep_days: 1,
            keep_per_day: 1,
            ..Default::default()
        };
        let (keep, _) = Policy::new(criteria, now).select(&items);
        // identical timestamps rank by id
        assert!(keep.contains("a"));
        assert_eq!(keep.len(), 1);
    }
}
