/// Trait representing a clustering over a set of nodes.
/// Each node is assigned a single integer label.
pub trait Clustering: std::fmt::Debug {
    /// Fresh clustering with each node in its own cluster
    fn init_different_clusters(num_nodes: usize) -> Self;

    /// Clustering with a known set of labels. Unused labels are removed.
    fn new_from_labels(labels: &[usize]) -> Self;

    /// Members of each cluster, in increasing node order
    fn nodes_per_cluster(&self) -> Vec<Vec<usize>>;

    /// Label of node `i`
    fn get(&self, i: usize) -> usize;

    /// Set the label of node `i`. Must keep the number of clusters up to date.
    fn set(&mut self, i: usize, cluster: usize);

    /// Total number of nodes
    fn nodes(&self) -> usize;

    /// Number of cluster labels in use (an upper bound until `remove_empty_clusters` is called)
    fn num_clusters(&self) -> usize;

    /// Renumber labels consecutively, dropping unused ones
    fn remove_empty_clusters(&mut self);

    /// Apply a clustering of the clusters: node `i` gets label `coarse.get(self.get(i))`.
    fn merge_clusters<C: Clustering>(&mut self, coarse: &C) {
        for i in 0..self.nodes() {
            self.set(i, coarse.get(self.get(i)))
        }

        self.remove_empty_clusters();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// A Vec-backed implementation of `Clustering`
pub struct SimpleClustering {
    labels: Vec<usize>,
    num_clusters: usize,
}

impl SimpleClustering {
    /// Per-node labels
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Consume into per-node labels
    pub fn into_labels(self) -> Vec<usize> {
        self.labels
    }

    /// Renumber clusters by decreasing size, so cluster 0 is the largest.
    /// Equal-sized clusters are ordered by their smallest member.
    pub fn relabel_by_size(&mut self) {
        let members = self.nodes_per_cluster();
        let mut order: Vec<usize> = (0..members.len()).filter(|&c| !members[c].is_empty()).collect();
        order.sort_by_key(|&c| (std::cmp::Reverse(members[c].len()), members[c][0]));

        let mut new_label = vec![usize::MAX; members.len()];
        for (new, &old) in order.iter().enumerate() {
            new_label[old] = new;
        }
        for l in self.labels.iter_mut() {
            *l = new_label[*l];
        }
        self.num_clusters = order.len();
    }
}

impl Clustering for SimpleClustering {
    fn init_different_clusters(num_nodes: usize) -> Self {
        SimpleClustering {
            labels: (0..num_nodes).collect(),
            num_clusters: num_nodes,
        }
    }

    fn new_from_labels(input_labels: &[usize]) -> Self {
        let num_clusters = input_labels.iter().max().map_or(0, |&m| m + 1);
        let mut r = SimpleClustering {
            labels: input_labels.to_vec(),
            num_clusters,
        };
        r.remove_empty_clusters();
        r
    }

    fn nodes_per_cluster(&self) -> Vec<Vec<usize>> {
        let mut cluster_lists = vec![Vec::new(); self.num_clusters()];

        for (node, &label) in self.labels.iter().enumerate() {
            cluster_lists[label].push(node)
        }

        cluster_lists
    }

    fn get(&self, node: usize) -> usize {
        self.labels[node]
    }

    fn set(&mut self, node: usize, label: usize) {
        self.labels[node] = label;
        if label >= self.num_clusters {
            self.num_clusters = label + 1;
        }
    }

    fn nodes(&self) -> usize {
        self.labels.len()
    }

    fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    fn remove_empty_clusters(&mut self) {
        let mut counts = vec![0usize; self.num_clusters];
        for &l in &self.labels {
            counts[l] += 1;
        }

        let mut new_labels = vec![usize::MAX; self.num_clusters];
        let mut next = 0;
        for (old, &count) in counts.iter().enumerate() {
            if count > 0 {
                new_labels[old] = next;
                next += 1;
            }
        }

        for l in self.labels.iter_mut() {
            *l = new_labels[*l];
        }
        self.num_clusters = next;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_labels() {
        let c = SimpleClustering::new_from_labels(&[1, 2, 3, 4, 5]);
        assert_eq!(c.num_clusters(), 5);
        assert_eq!(c.labels(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_operations() {
        let mut c = SimpleClustering::init_different_clusters(10);
        assert_eq!(c.num_clusters(), 10);

        c.set(8, 0);
        c.set(7, 0);
        c.remove_empty_clusters();

        assert_eq!(c.num_clusters(), 8);
        assert_eq!(c.get(9), 7);
        assert_eq!(c.nodes_per_cluster()[0], vec![0, 7, 8]);
    }

    #[test]
    fn test_merge_clusters() {
        let mut c = SimpleClustering::new_from_labels(&[0, 0, 1, 2, 2]);
        let coarse = SimpleClustering::new_from_labels(&[0, 1, 0]);
        c.merge_clusters(&coarse);
        assert_eq!(c.labels(), &[0, 0, 1, 0, 0]);
        assert_eq!(c.num_clusters(), 2);
    }

    #[test]
    fn test_relabel_by_size() {
        // sizes: label 0 -> 1, label 1 -> 3, label 2 -> 1, label 3 -> 2
        let mut c = SimpleClustering::new_from_labels(&[2, 1, 1, 3, 0, 1, 3]);
        c.relabel_by_size();
        // largest (old 1) -> 0, then old 3 -> 1, then the singletons by smallest member:
        // old 2 (node 0) -> 2, old 0 (node 4) -> 3
        assert_eq!(c.labels(), &[2, 0, 0, 1, 3, 0, 1]);
        assert_eq!(c.num_clusters(), 4);
    }
}
