//! Post-fetch sorting and pagination.
//!
//! Ordering is never pushed into `PromQL`. Results are sorted after the fetch
//! with a stable multi-key comparator, then paged with offset and limit.

use std::cmp::Ordering;

use crate::types::{Labels, Point, Sample, Series};

/// A field results can be ordered by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SortField {
    /// The sample value. NaN sorts above every number.
    Value,
    /// The sample timestamp.
    Timestamp,
    /// A label value, compared lexicographically.
    Label(String),
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnOrder {
    /// The field.
    pub field: SortField,
    /// Reverse the field's natural order.
    pub descending: bool,
}

impl ColumnOrder {
    /// Ascending order on `field`.
    #[must_use]
    pub const fn asc(field: SortField) -> Self {
        Self {
            field,
            descending: false,
        }
    }

    /// Descending order on `field`.
    #[must_use]
    pub const fn desc(field: SortField) -> Self {
        Self {
            field,
            descending: true,
        }
    }
}

/// Something that can be ordered by label, value and timestamp.
pub trait Sortable {
    /// The label set.
    fn sort_labels(&self) -> &Labels;
    /// The point compared by `value` and `timestamp`.
    fn sort_point(&self) -> Option<&Point>;
}

impl Sortable for Sample {
    fn sort_labels(&self) -> &Labels {
        &self.labels
    }

    fn sort_point(&self) -> Option<&Point> {
        Some(&self.point)
    }
}

/// Series compare by their last point.
impl Sortable for Series {
    fn sort_labels(&self) -> &Labels {
        &self.labels
    }

    fn sort_point(&self) -> Option<&Point> {
        self.last_point()
    }
}

/// Compares two values with NaN greater than every number.
#[must_use]
pub fn compare_values(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn compare_field<T: Sortable>(a: &T, b: &T, field: &SortField) -> Ordering {
    match field {
        SortField::Value => match (a.sort_point(), b.sort_point()) {
            (Some(pa), Some(pb)) => compare_values(pa.value, pb.value),
            (pa, pb) => pa.is_some().cmp(&pb.is_some()),
        },
        SortField::Timestamp => {
            let ta = a.sort_point().map(|p| p.timestamp);
            let tb = b.sort_point().map(|p| p.timestamp);
            ta.cmp(&tb)
        }
        SortField::Label(name) => {
            let la = a.sort_labels().get(name);
            let lb = b.sort_labels().get(name);
            la.cmp(&lb)
        }
    }
}

/// Compares two items key by key. The first non-equal key decides.
#[must_use]
pub fn compare_by<T: Sortable>(a: &T, b: &T, orders: &[ColumnOrder]) -> Ordering {
    for order in orders {
        let ordering = compare_field(a, b, &order.field);
        let ordering = if order.descending {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Sorts items in place. Items equal on every key keep their backend order.
pub fn sort_by_columns<T: Sortable>(items: &mut [T], orders: &[ColumnOrder]) {
    if orders.is_empty() {
        return;
    }
    items.sort_by(|a, b| compare_by(a, b, orders));
}

/// Applies offset, then limit.
///
/// An offset past the end yields an empty list; a limit past the end is a no-op.
#[must_use]
pub fn paginate<T>(items: Vec<T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    let offset = offset.unwrap_or(0);
    if offset == 0 && limit.is_none() {
        return items;
    }
    let limit = limit.unwrap_or(usize::MAX);
    items.into_iter().skip(offset).take(limit).collect()
}
