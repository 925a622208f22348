use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Cell indices grouped by label. Group `i` owns `indices[offsets[i]..offsets[i + 1]]`
/// (the last group runs to the end of `indices`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LabelClass {
    pub labels: Vec<String>,
    pub offsets: Vec<usize>,
    pub indices: Vec<usize>,
}

impl LabelClass {
    pub fn new(labels: Vec<String>, offsets: Vec<usize>, indices: Vec<usize>) -> Result<LabelClass, Error> {
        if labels.len() != offsets.len() {
            return Err(format_err!("Label and offsets length unequal"));
        }
        if offsets.windows(2).any(|w| w[0] > w[1]) || offsets.last().is_some_and(|&o| o > indices.len()) {
            return Err(format_err!("offsets must be non-decreasing and within the index list"));
        }
        Ok(LabelClass {
            labels,
            offsets,
            indices,
        })
    }

    /// Group positions `0..labels.len()` by their label. Groups appear in first-appearance order
    /// and keep their members in increasing order.
    pub fn from_labels<S: AsRef<str>>(per_cell: &[S]) -> LabelClass {
        let mut order: Vec<String> = Vec::new();
        let mut members: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, label) in per_cell.iter().enumerate() {
            let label = label.as_ref();
            members
                .entry(label)
                .or_insert_with(|| {
                    order.push(label.to_string());
                    Vec::new()
                })
                .push(i);
        }
        let mut offsets = Vec::with_capacity(order.len());
        let mut indices = Vec::with_capacity(per_cell.len());
        for label in &order {
            offsets.push(indices.len());
            indices.extend_from_slice(&members[label.as_str()]);
        }
        LabelClass {
            labels: order,
            offsets,
            indices,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    fn get_label_index(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|x| x == label)
    }

    fn group(&self, idx: usize) -> &[usize] {
        let start = self.offsets[idx];
        let end = self.offsets.get(idx + 1).copied().unwrap_or(self.indices.len());
        &self.indices[start..end]
    }

    /// Members of `label`, or None if the label doesn't exist.
    pub fn get_indices(&self, label: &str) -> Option<&[usize]> {
        self.get_label_index(label).map(|idx| self.group(idx))
    }

    /// Iterate over `(label, members)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[usize])> {
        (0..self.len()).map(move |i| (self.labels[i].as_str(), self.group(i)))
    }

    /// Drop every label containing `pattern`. Returns the members of the dropped labels.
    pub fn remove_like(&mut self, pattern: &str) -> BTreeSet<usize> {
        let mut removed = BTreeSet::default();
        let mut idx = 0;
        while idx < self.labels.len() {
            if self.labels[idx].contains(pattern) {
                self.remove_index(idx, &mut removed);
            } else {
                idx += 1;
            }
        }
        removed
    }

    fn remove_index(&mut self, idx: usize, set: &mut BTreeSet<usize>) {
        self.labels.remove(idx);
        let start = self.offsets.remove(idx);
        let end = match self.offsets.get(idx) {
            Some(&end) => {
                let len = end - start;
                for v in self.offsets.iter_mut().skip(idx) {
                    *v -= len;
                }
                end
            }
            None => self.indices.len(),
        };
        set.extend(self.indices.drain(start..end));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn blocks() -> LabelClass {
        LabelClass::new(
            vec!["a", "b", "c", "d"].into_iter().map(String::from).collect(),
            vec![0, 10, 21, 34],
            (0..50).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_from_labels() {
        let lc = LabelClass::from_labels(&["stim", "ctrl", "stim", "ctrl", "stim"]);
        assert_eq!(lc.labels(), &["stim".to_string(), "ctrl".to_string()]);
        assert_eq!(lc.get_indices("stim"), Some(&[0usize, 2, 4][..]));
        assert_eq!(lc.get_indices("ctrl"), Some(&[1usize, 3][..]));
        assert_eq!(lc.get_indices("none"), None);
        assert_eq!(lc.iter().map(|(_, m)| m.len()).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[test]
    fn test_remove_like() {
        let mut xa = blocks();
        let ba = xa.remove_like("a");
        assert_eq!(ba, (0..10).collect::<BTreeSet<_>>());
        assert_eq!(xa.offsets, vec![0, 11, 24]);
        assert_eq!(xa.indices, (10..50).collect::<Vec<_>>());

        let mut xc = blocks();
        let bc = xc.remove_like("c");
        assert_eq!(bc, (21..34).collect::<BTreeSet<_>>());
        assert_eq!(xc.labels, vec!["a", "b", "d"]);
        assert_eq!(xc.offsets, vec![0, 10, 21]);
        assert_eq!(xc.get_indices("d"), Some(&(34..50).collect::<Vec<_>>()[..]));

        let mut xd = blocks();
        assert_eq!(xd.remove_like("d").len(), 16);
        assert_eq!(xd.indices, (0..34).collect::<Vec<_>>());
    }

    #[test]
    fn test_new_validates() {
        assert!(LabelClass::new(vec!["a".into()], vec![], vec![]).is_err());
        assert!(LabelClass::new(vec!["a".into(), "b".into()], vec![3, 1], (0..4).collect()).is_err());
    }
}
