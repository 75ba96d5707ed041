//! First-fit reservation allocator.
//!
//! Candidates are taken in registration order. A candidate is skipped when
//! the requesting owner already holds a reservation on it, or when the
//! requested window, with its start moved back by the padding, overlaps an
//! existing reservation. No load balancing is attempted.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::control::ControlError;
use crate::state::{Reservation, ReservationStatus, ResourceStatus, StoreTx};

/// Accepted start date layout (UTC).
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Filter key holding the number of wanted resources.
pub const NB_NODES: &str = "nb_nodes";

/// Filter key selecting a single resource by name.
pub const NAME: &str = "name";

/// A validated reservation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ReserveRequest {
    pub owner: String,
    pub nb_nodes: usize,
    /// Property filter without `nb_nodes`.
    pub filter: Map<String, Value>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl ReserveRequest {
    /// Validate raw request arguments. `nb_nodes` is removed from the filter.
    pub fn parse(
        mut filter: Map<String, Value>,
        owner: &str,
        start_date: &Value,
        duration_hours: i64,
    ) -> Result<Self, ControlError> {
        let start_date = parse_start_date(start_date)?;
        let nb_nodes = filter
            .remove(NB_NODES)
            .as_ref()
            .and_then(positive_count)
            .ok_or(ControlError::MissingNodeCount)?;
        let end_date = TimeDelta::try_hours(duration_hours)
            .filter(|_| duration_hours > 0)
            .and_then(|length| start_date.checked_add_signed(length))
            .ok_or(ControlError::InvalidDuration(duration_hours))?;
        Ok(Self {
            owner: owner.to_string(),
            nb_nodes,
            filter,
            start_date,
            end_date,
        })
    }
}

/// Parse `YYYY-MM-DD HH:MM:SS` or a Unix timestamp in seconds.
pub fn parse_start_date(value: &Value) -> Result<DateTime<Utc>, ControlError> {
    let invalid = || ControlError::InvalidDate(value_str(value));
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(invalid),
        Value::String(s) => {
            if let Ok(date) = NaiveDateTime::parse_from_str(s, DATE_FORMAT) {
                return Ok(date.and_utc());
            }
            if s.len() == 10 && s.bytes().all(|b| b.is_ascii_digit()) {
                return s
                    .parse()
                    .ok()
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
                    .ok_or_else(invalid);
            }
            Err(invalid())
        }
        _ => Err(invalid()),
    }
}

fn positive_count(value: &Value) -> Option<usize> {
    let count = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    usize::try_from(count).ok().filter(|&n| n > 0)
}

/// Filter values compare against stored property strings.
pub fn value_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Every filter entry must equal the property of the same name.
pub fn matches_filter(props: &BTreeMap<String, String>, filter: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(key, want)| props.get(key).is_some_and(|have| *have == value_str(want)))
}

/// True when `[start - padding, end)` intersects an existing window.
pub fn overlaps(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    padding: TimeDelta,
    existing: &Reservation,
) -> bool {
    start - padding < existing.end_date && end > existing.start_date
}

/// Select and reserve resources. Returns the reserved resource names, which
/// may be fewer than requested.
pub fn reserve(
    tx: &StoreTx<'_>,
    request: &ReserveRequest,
    padding: TimeDelta,
) -> Result<Vec<String>, ControlError> {
    let candidates: Vec<String> = match request.filter.get(NAME) {
        Some(name) => tx
            .get_resource(&value_str(name))?
            .map(|r| r.name)
            .into_iter()
            .collect(),
        None => {
            let mut matching = Vec::new();
            for resource in tx.list_resources()? {
                let props = tx.resource_properties(&resource.name)?;
                if matches_filter(&props, &request.filter) {
                    matching.push(resource.name);
                }
            }
            matching
        }
    };
    debug!(?candidates, "Filtered resources");

    let mut selected = Vec::new();
    for name in candidates {
        if selected.len() == request.nb_nodes {
            break;
        }
        let taken = tx.reservations_for_resource(&name)?.iter().any(|r| {
            r.owner == request.owner
                || overlaps(request.start_date, request.end_date, padding, r)
        });
        if !taken {
            selected.push(name);
        }
    }

    for name in &selected {
        tx.insert_reservation(&Reservation {
            resource: name.clone(),
            owner: request.owner.clone(),
            bin: None,
            start_date: request.start_date,
            end_date: request.end_date,
            status: ReservationStatus::Configuring,
            action_state: String::new(),
        })?;

        if let Some(mut resource) = tx.get_resource(name)? {
            if resource.status == ResourceStatus::Available {
                resource.status = ResourceStatus::Configuring;
                resource.owner = Some(request.owner.clone());
                resource.start_date = Some(request.start_date);
                resource.end_date = Some(request.end_date);
                tx.update_resource(&resource)?;
            }
        }
    }
    info!(owner = %request.owner, ?selected, wanted = request.nb_nodes, "Reserved resources");
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn at(hour: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_772_323_200 + hour * 3600, 0).unwrap()
    }

    fn existing(start: i64, end: i64) -> Reservation {
        Reservation {
            resource: "node-1".into(),
            owner: "b@x.org".into(),
            bin: None,
            start_date: at(start),
            end_date: at(end),
            status: ReservationStatus::Ready,
            action_state: String::new(),
        }
    }

    #[rstest]
    #[case(json!("2026-03-01 08:30:00"), "2026-03-01T08:30:00+00:00")]
    #[case(json!(1772352000), "2026-03-01T08:00:00+00:00")]
    #[case(json!("1772352000"), "2026-03-01T08:00:00+00:00")]
    fn test_parse_start_date(#[case] input: Value, #[case] expected: &str) {
        assert_eq!(parse_start_date(&input).unwrap().to_rfc3339(), expected);
    }

    #[rstest]
    #[case(json!("2026-03-01"))]
    #[case(json!("01/03/2026 08:00:00"))]
    #[case(json!(null))]
    #[case(json!("17723520"))]
    fn test_parse_start_date_rejects(#[case] input: Value) {
        assert!(matches!(
            parse_start_date(&input),
            Err(ControlError::InvalidDate(_))
        ));
    }

    #[rstest]
    #[case(json!({}))]
    #[case(json!({"nb_nodes": 0}))]
    #[case(json!({"nb_nodes": "-2"}))]
    #[case(json!({"nb_nodes": "three"}))]
    fn test_request_requires_positive_count(#[case] filter: Value) {
        let Value::Object(filter) = filter else { unreachable!() };
        let result = ReserveRequest::parse(filter, "a@x.org", &json!("2026-03-01 08:00:00"), 3);
        assert!(matches!(result, Err(ControlError::MissingNodeCount)));
    }

    #[rstest]
    #[case(0)]
    #[case(-4)]
    #[case(10_000_000_000)]
    #[case(i64::MAX)]
    fn test_request_rejects_duration(#[case] hours: i64) {
        let Value::Object(filter) = json!({"nb_nodes": 1}) else { unreachable!() };
        let result = ReserveRequest::parse(filter, "a@x.org", &json!("2030-03-01 08:00:00"), hours);
        assert!(matches!(result, Err(ControlError::InvalidDuration(h)) if h == hours));
    }

    #[test]
    fn test_request_strips_count() {
        let Value::Object(filter) = json!({"nb_nodes": "2", "model": "RPI4B8G"}) else {
            unreachable!()
        };
        let request =
            ReserveRequest::parse(filter, "a@x.org", &json!("2026-03-01 08:00:00"), 3).unwrap();
        assert_eq!(request.nb_nodes, 2);
        assert!(!request.filter.contains_key(NB_NODES));
        assert_eq!(request.end_date - request.start_date, TimeDelta::hours(3));
    }

    #[rstest]
    // existing 10:00-13:00, padding 15 min
    #[case(7, 10, false)]
    #[case(14, 16, false)]
    #[case(11, 12, true)]
    #[case(9, 11, true)]
    #[case(12, 14, true)]
    #[case(8, 15, true)]
    fn test_overlaps(#[case] start: i64, #[case] end: i64, #[case] expected: bool) {
        let padding = TimeDelta::minutes(15);
        assert_eq!(overlaps(at(start), at(end), padding, &existing(10, 13)), expected);
    }

    #[test]
    fn test_padding_blocks_back_to_back() {
        let padding = TimeDelta::minutes(15);
        let start = at(13) + TimeDelta::minutes(10);
        assert!(overlaps(start, at(16), padding, &existing(10, 13)));
        let start = at(13) + TimeDelta::minutes(15);
        assert!(!overlaps(start, at(16), padding, &existing(10, 13)));
    }
}
