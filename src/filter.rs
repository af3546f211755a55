//! Subscription filters.
//!
//! A filter is plain data evaluated by a pure function over an event's
//! attributes. Evaluation is total: unknown attribute names simply do not
//! match, they never error.
//!
//! ```text
//! Filter                                   | Attributes                    | Match
//! -----------------------------------------|-------------------------------|------
//! MatchAll                                 | (anything)                    | yes
//! AllowList(eventName, [ObjectCreated:Put])| eventName=ObjectCreated:Put   | yes
//! AllowList(eventName, [ObjectCreated:Put])| eventName=ObjectRemoved:Delete| no
//! AllowList(metadata_type, [Caption])      | (attribute absent)            | no
//! ```

use crate::event::{AttributeValue, Attributes};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors detected when a filter is validated at topology build time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("allow-list filter has an empty attribute name")]
    EmptyField,

    #[error("allow-list filter on '{0}' has no values")]
    EmptyAllowList(String),
}

/// A subscription filter.
///
/// `MatchAll` stands for "no filter" and accepts every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterExpr {
    #[default]
    MatchAll,
    AllowList {
        field: String,
        values: Vec<AttributeValue>,
    },
}

impl FilterExpr {
    /// Build an allow-list filter over one attribute.
    pub fn allow_list<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<AttributeValue>,
    {
        FilterExpr::AllowList {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluate the filter against an attribute map.
    pub fn matches(&self, attributes: &Attributes) -> bool {
        match self {
            FilterExpr::MatchAll => true,
            FilterExpr::AllowList { field, values } => match attributes.get(field) {
                Some(actual) => values.iter().any(|allowed| same_value(allowed, actual)),
                None => false,
            },
        }
    }

    /// Name of the attribute this filter inspects, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            FilterExpr::MatchAll => None,
            FilterExpr::AllowList { field, .. } => Some(field),
        }
    }

    /// Reject filters that can never be satisfied by construction.
    pub fn validate(&self) -> Result<(), FilterError> {
        match self {
            FilterExpr::MatchAll => Ok(()),
            FilterExpr::AllowList { field, values } => {
                if field.is_empty() {
                    return Err(FilterError::EmptyField);
                }
                if values.is_empty() {
                    return Err(FilterError::EmptyAllowList(field.clone()));
                }
                Ok(())
            }
        }
    }
}

fn same_value(allowed: &AttributeValue, actual: &AttributeValue) -> bool {
    match (allowed, actual) {
        (AttributeValue::String(a), AttributeValue::String(b)) => a == b,
        (AttributeValue::Number(a), AttributeValue::Number(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ATTR_EVENT_NAME, ATTR_MESSAGE_TYPE, ATTR_METADATA_TYPE};
    use proptest::prelude::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), AttributeValue::from(*v)))
            .collect()
    }

    #[test]
    fn test_match_all() {
        assert!(FilterExpr::MatchAll.matches(&Attributes::new()));
        assert!(FilterExpr::MatchAll.matches(&attrs(&[("x", "y")])));
    }

    #[test]
    fn test_allow_list_hit_and_miss() {
        let filter = FilterExpr::allow_list(
            ATTR_EVENT_NAME,
            ["ObjectCreated:Put", "ObjectCreated:Post", "ObjectCreated:CompleteMultipartUpload"],
        );

        assert!(filter.matches(&attrs(&[(ATTR_EVENT_NAME, "ObjectCreated:Post")])));
        assert!(!filter.matches(&attrs(&[(ATTR_EVENT_NAME, "ObjectRemoved:Delete")])));
        assert!(!filter.matches(&attrs(&[(ATTR_EVENT_NAME, "objectcreated:put")])));
    }

    #[test]
    fn test_field_names_inspected_attribute() {
        assert_eq!(FilterExpr::MatchAll.field(), None);
        assert_eq!(FilterExpr::allow_list(ATTR_METADATA_TYPE, ["Caption"]).field(), Some(ATTR_METADATA_TYPE));
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let filter = FilterExpr::allow_list(ATTR_METADATA_TYPE, ["Caption", "Date", "name"]);
        assert!(!filter.matches(&Attributes::new()));
        assert!(!filter.matches(&attrs(&[(ATTR_MESSAGE_TYPE, "Caption")])));
    }

    #[test]
    fn test_numbers_compare_numerically() {
        let filter = FilterExpr::allow_list("priority", [1_i64, 2]);
        let mut attributes = Attributes::new();
        attributes.insert("priority".into(), AttributeValue::Number(2.0));
        assert!(filter.matches(&attributes));

        attributes.insert("priority".into(), AttributeValue::from("2"));
        assert!(!filter.matches(&attributes));
    }

    #[test]
    fn test_validate() {
        assert!(FilterExpr::MatchAll.validate().is_ok());
        assert_eq!(
            FilterExpr::allow_list("", ["a"]).validate(),
            Err(FilterError::EmptyField)
        );
        assert_eq!(
            FilterExpr::allow_list::<_, &str>("message_type", []).validate(),
            Err(FilterError::EmptyAllowList("message_type".into()))
        );
    }

    #[test]
    fn test_filter_deserialize() {
        let filter: FilterExpr = serde_json::from_str(
            r#"{"kind": "allow_list", "field": "message_type", "values": ["StatusUpdate"]}"#,
        )
        .unwrap();
        assert_eq!(filter, FilterExpr::allow_list(ATTR_MESSAGE_TYPE, ["StatusUpdate"]));

        let filter: FilterExpr = serde_json::from_str(r#"{"kind": "match_all"}"#).unwrap();
        assert_eq!(filter, FilterExpr::MatchAll);
    }

    fn small_attributes() -> impl Strategy<Value = Attributes> {
        prop::collection::btree_map(
            prop::sample::select(vec!["a", "b", "c"]).prop_map(String::from),
            prop::sample::select(vec!["x", "y", "z"]).prop_map(AttributeValue::from),
            0..3,
        )
    }

    proptest! {
        #[test]
        fn prop_allow_list_matches_iff_value_listed(
            attributes in small_attributes(),
            field in prop::sample::select(vec!["a", "b", "c", "d"]),
            allowed in prop::collection::vec(prop::sample::select(vec!["x", "y", "z"]), 1..3),
        ) {
            let filter = FilterExpr::allow_list(field, allowed.clone());
            let expected = attributes
                .get(field)
                .and_then(AttributeValue::as_str)
                .map(|v| allowed.iter().any(|a| *a == v))
                .unwrap_or(false);
            prop_assert_eq!(filter.matches(&attributes), expected);
        }

        #[test]
        fn prop_match_all_accepts_everything(attributes in small_attributes()) {
            prop_assert!(FilterExpr::MatchAll.matches(&attributes));
        }
    }
}
