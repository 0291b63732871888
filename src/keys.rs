//! Durable key layout. Every record lives under `<bucket>/<id>`.

/// Named partitions of the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    Jobs,
    Builds,
    Deployments,
    Releases,
    Artifacts,
    StatusReports,
    Runners,
    Config,
    /// Pre-versioned config bucket, migrated into `Config` at startup.
    LegacyConfig,
    Users,
    Workspaces,
    Projects,
    Pipelines,
    PipelineRuns,
    Tasks,
    Triggers,
    AuthMethods,
    OnDemandRunnerConfigs,
    ServerConfig,
    ServerId,
    ServerUrlToken,
}

impl Bucket {
    pub const ALL: [Bucket; 21] = [
        Bucket::Jobs,
        Bucket::Builds,
        Bucket::Deployments,
        Bucket::Releases,
        Bucket::Artifacts,
        Bucket::StatusReports,
        Bucket::Runners,
        Bucket::Config,
        Bucket::LegacyConfig,
        Bucket::Users,
        Bucket::Workspaces,
        Bucket::Projects,
        Bucket::Pipelines,
        Bucket::PipelineRuns,
        Bucket::Tasks,
        Bucket::Triggers,
        Bucket::AuthMethods,
        Bucket::OnDemandRunnerConfigs,
        Bucket::ServerConfig,
        Bucket::ServerId,
        Bucket::ServerUrlToken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Jobs => "jobs",
            Bucket::Builds => "builds",
            Bucket::Deployments => "deployments",
            Bucket::Releases => "releases",
            Bucket::Artifacts => "artifacts",
            Bucket::StatusReports => "status_reports",
            Bucket::Runners => "runners",
            Bucket::Config => "config_v2",
            Bucket::LegacyConfig => "config",
            Bucket::Users => "users",
            Bucket::Workspaces => "workspaces",
            Bucket::Projects => "projects",
            Bucket::Pipelines => "pipelines",
            Bucket::PipelineRuns => "pipeline_runs",
            Bucket::Tasks => "tasks",
            Bucket::Triggers => "triggers",
            Bucket::AuthMethods => "auth_methods",
            Bucket::OnDemandRunnerConfigs => "ondemand_runner_configs",
            Bucket::ServerConfig => "server_config",
            Bucket::ServerId => "server_id",
            Bucket::ServerUrlToken => "server_url_token",
        }
    }

    /// Buckets whose ids are looked up case-insensitively.
    pub fn lowercase_ids(&self) -> bool {
        matches!(
            self,
            Bucket::Workspaces | Bucket::Projects | Bucket::Config | Bucket::LegacyConfig
        )
    }
}

/// The KV store key for a record in a bucket.
pub fn bucket_key(bucket: Bucket, id: &str) -> String {
    if bucket.lowercase_ids() {
        format!("{}/{}", bucket.as_str(), id.to_lowercase())
    } else {
        format!("{}/{}", bucket.as_str(), id)
    }
}

/// Scan prefix for every record in a bucket.
pub fn bucket_prefix(bucket: Bucket) -> String {
    format!("{}/", bucket.as_str())
}

/// Strip the bucket prefix from a raw key, returning the record id.
pub fn id_from_key(bucket: Bucket, key: &[u8]) -> Option<String> {
    let prefix = bucket_prefix(bucket);
    let rest = key.strip_prefix(prefix.as_bytes())?;
    String::from_utf8(rest.to_vec()).ok()
}

/// Exclusive upper bound for a prefix scan: the prefix with its last byte incremented.
pub fn end_bound(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xFF: no finite bound exists, scan to the end of the keyspace.
    vec![u8::MAX; prefix.len() + 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_names_are_unique() {
        let mut names: Vec<&str> = Bucket::ALL.iter().map(|b| b.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Bucket::ALL.len());
    }

    #[test]
    fn keys_are_prefixed_by_bucket() {
        assert_eq!(bucket_key(Bucket::Jobs, "J1"), "jobs/J1");
        assert_eq!(bucket_key(Bucket::Workspaces, "Prod"), "workspaces/prod");
        assert_eq!(bucket_key(Bucket::Config, "A/B"), "config_v2/a/b");
        assert_eq!(bucket_prefix(Bucket::StatusReports), "status_reports/");
    }

    #[test]
    fn prefixes_do_not_overlap_in_scans() {
        // "config/" must not pick up "config_v2/..." keys
        let legacy = bucket_prefix(Bucket::LegacyConfig);
        let end = end_bound(&legacy);
        let current = bucket_key(Bucket::Config, "x");
        let in_range = current.as_bytes() >= legacy.as_bytes() && current.as_bytes() < &end[..];
        assert!(!in_range);
    }

    #[test]
    fn end_bound_increments_last_byte() {
        assert_eq!(end_bound("jobs/"), b"jobs0".to_vec());
        assert_eq!(end_bound("a\u{7f}"), b"a\x80".to_vec());
    }

    #[test]
    fn id_round_trips_from_key() {
        let key = bucket_key(Bucket::Runners, "r-1");
        assert_eq!(id_from_key(Bucket::Runners, key.as_bytes()).as_deref(), Some("r-1"));
        assert_eq!(id_from_key(Bucket::Jobs, key.as_bytes()), None);
    }
}
