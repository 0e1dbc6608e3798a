#![forbid(unsafe_code)]

//! Minimal list update for recalculated list properties.
//!
//! Instead of replacing a list wholesale, the longest common prefix and
//! suffix are kept and only the differing middle is replaced, so observers
//! see at most one removal and one insertion.

use ripple_model::Value;

/// Replace `remove` items at `index` with `insert`.
#[derive(Debug, Clone, PartialEq)]
pub struct ListSplice {
    pub index: usize,
    pub remove: usize,
    pub insert: Vec<Value>,
}

/// The single splice that turns `old` into `new`, or `None` if they are
/// equal.
#[must_use]
pub fn list_diff(old: &[Value], new: &[Value]) -> Option<ListSplice> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let remove = old.len() - prefix - suffix;
    let insert = new[prefix..new.len() - suffix].to_vec();
    if remove == 0 && insert.is_empty() {
        return None;
    }
    Some(ListSplice {
        index: prefix,
        remove,
        insert,
    })
}

/// Apply `splice` to `list` in place.
pub fn apply_splice(list: &mut Vec<Value>, splice: &ListSplice) {
    let end = splice.index + splice.remove;
    list.splice(splice.index..end, splice.insert.iter().cloned());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(items: &[i64]) -> Vec<Value> {
        items.iter().copied().map(Value::Int).collect()
    }

    #[test]
    fn equal_lists_need_no_splice() {
        assert_eq!(list_diff(&ints(&[1, 2, 3]), &ints(&[1, 2, 3])), None);
        assert_eq!(list_diff(&[], &[]), None);
    }

    #[test]
    fn single_replacement_keeps_prefix_and_suffix() {
        let splice = list_diff(&ints(&[1, 2, 3, 4]), &ints(&[1, 9, 3, 4])).unwrap();
        assert_eq!(
            splice,
            ListSplice {
                index: 1,
                remove: 1,
                insert: ints(&[9])
            }
        );
    }

    #[test]
    fn pure_insertion_and_removal() {
        assert_eq!(
            list_diff(&ints(&[1, 3]), &ints(&[1, 2, 3])),
            Some(ListSplice {
                index: 1,
                remove: 0,
                insert: ints(&[2])
            })
        );
        assert_eq!(
            list_diff(&ints(&[1, 2, 3]), &ints(&[1, 3])),
            Some(ListSplice {
                index: 1,
                remove: 1,
                insert: Vec::new()
            })
        );
    }

    #[test]
    fn repeated_values_do_not_overlap_prefix_and_suffix() {
        let old = ints(&[1, 1]);
        let new = ints(&[1, 1, 1]);
        let splice = list_diff(&old, &new).unwrap();
        assert_eq!(splice.remove, 0);
        assert_eq!(splice.insert.len(), 1);
        let mut patched = old.clone();
        apply_splice(&mut patched, &splice);
        assert_eq!(patched, new);
    }
}
