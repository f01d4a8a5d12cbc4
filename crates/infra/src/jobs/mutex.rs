use std::collections::BTreeSet;

/// Sets of job types that must never run at the same time.
///
/// Starting a job locks its own type plus every type that shares a group
/// with it, so two members of one group exclude each other through the
/// shared locks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutexGroups {
    groups: Vec<BTreeSet<String>>,
}

impl MutexGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group<I, S>(mut self, job_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let group: BTreeSet<String> = job_types.into_iter().map(Into::into).collect();
        if group.len() > 1 {
            self.groups.push(group);
        }
        self
    }

    pub fn groups(&self) -> &[BTreeSet<String>] {
        &self.groups
    }

    /// The lock set for starting (and later stopping) `job_type`.
    pub fn lock_set(&self, job_type: &str) -> BTreeSet<String> {
        let mut set = BTreeSet::from([job_type.to_string()]);
        for group in self.groups.iter().filter(|g| g.contains(job_type)) {
            set.extend(group.iter().cloned());
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_set_includes_group_members() {
        let groups = MutexGroups::new()
            .with_group(["import", "export"])
            .with_group(["export", "reindex"])
            .with_group(["lonely"]);

        assert_eq!(groups.groups().len(), 2);
        assert_eq!(
            groups.lock_set("export").into_iter().collect::<Vec<_>>(),
            vec!["export", "import", "reindex"]
        );
        assert_eq!(groups.lock_set("import").len(), 2);
        assert_eq!(groups.lock_set("other").len(), 1);
    }
}
