//! Resource limit validation
//!
//! [`LimitsSpec`] is the raw, partially filled set of values coming from a
//! config file, the command line or an API caller. [`LimitsSpec::validate`] is
//! the only way to obtain a [`ResourceLimits`], so every value that reaches a
//! control file has passed the same rules.

use serde::{Deserialize, Serialize};

use super::error::{CgroupError, Result};
use super::topology::HostTopology;

pub const DEFAULT_CPU_EXCEED_RATE: f64 = 2.5;
pub const DEFAULT_CPU_CFS_PERIOD: u64 = 200_000;
pub const DEFAULT_CPU_CFS_QUOTA: u64 = 200_000;
pub const DEFAULT_CPU_RT_PERIOD: u64 = 1_000_000;
pub const DEFAULT_CPU_RT_RUNTIME: u64 = 950_000;
pub const DEFAULT_CPU_SHARES: u64 = 1024;

pub const CFS_PERIOD_MIN: u64 = 1_000;
pub const CFS_PERIOD_MAX: u64 = 1_000_000;
pub const RT_PERIOD_MAX: u64 = 2_000_000;
pub const SWAPPINESS_MAX: u64 = 100;

/// `-1` in memory fields means unlimited
pub const MEMORY_UNLIMITED: i64 = -1;

/// Raw limit values before validation. `None` means "use the default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSpec {
    /// Headroom multiplier for CFS quota and RT runtime
    pub cpu_exceed_rate: Option<f64>,
    pub cpu_cfs_period: Option<u64>,
    pub cpu_cfs_quota: Option<u64>,
    pub cpu_rt_period: Option<u64>,
    pub cpu_rt_runtime: Option<u64>,
    pub cpu_shares: Option<u64>,
    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,
    pub memory_limit: Option<i64>,
    pub memory_soft_limit: Option<i64>,
    pub memory_swap_limit: Option<i64>,
    pub memory_swappiness: Option<u64>,
    pub pids_max: Option<u64>,
}

impl LimitsSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay `overrides` on top of `self`; set fields in `overrides` win
    pub fn merge(self, overrides: LimitsSpec) -> Self {
        Self {
            cpu_exceed_rate: overrides.cpu_exceed_rate.or(self.cpu_exceed_rate),
            cpu_cfs_period: overrides.cpu_cfs_period.or(self.cpu_cfs_period),
            cpu_cfs_quota: overrides.cpu_cfs_quota.or(self.cpu_cfs_quota),
            cpu_rt_period: overrides.cpu_rt_period.or(self.cpu_rt_period),
            cpu_rt_runtime: overrides.cpu_rt_runtime.or(self.cpu_rt_runtime),
            cpu_shares: overrides.cpu_shares.or(self.cpu_shares),
            cpuset_cpus: overrides.cpuset_cpus.or(self.cpuset_cpus),
            cpuset_mems: overrides.cpuset_mems.or(self.cpuset_mems),
            memory_limit: overrides.memory_limit.or(self.memory_limit),
            memory_soft_limit: overrides.memory_soft_limit.or(self.memory_soft_limit),
            memory_swap_limit: overrides.memory_swap_limit.or(self.memory_swap_limit),
            memory_swappiness: overrides.memory_swappiness.or(self.memory_swappiness),
            pids_max: overrides.pids_max.or(self.pids_max),
        }
    }

    /// Validate against the host and produce the immutable limit set
    pub fn validate(&self, topology: &HostTopology) -> Result<ResourceLimits> {
        let cpu_count = u64::from(topology.cpu_count());
        let exceed_rate =
            validate_exceed_rate(self.cpu_exceed_rate.unwrap_or(DEFAULT_CPU_EXCEED_RATE))?;

        let cfs_period = validate_cfs_period(self.cpu_cfs_period.unwrap_or(DEFAULT_CPU_CFS_PERIOD))?;
        let cfs_quota = validate_cfs_quota(
            self.cpu_cfs_quota.unwrap_or(DEFAULT_CPU_CFS_QUOTA),
            cfs_period,
            cpu_count,
            exceed_rate,
        )?;

        let rt_period = validate_rt_period(self.cpu_rt_period.unwrap_or(DEFAULT_CPU_RT_PERIOD))?;
        let rt_runtime = validate_rt_runtime(
            self.cpu_rt_runtime.unwrap_or(DEFAULT_CPU_RT_RUNTIME),
            rt_period,
            cpu_count,
            exceed_rate,
        )?;

        let shares = validate_shares(self.cpu_shares.unwrap_or(DEFAULT_CPU_SHARES))?;

        let cpuset_cpus = cpu_list_or_full(
            self.cpuset_cpus.as_deref(),
            ListKind::Cpus,
            topology.cpu_count(),
        )?;
        let cpuset_mems = cpu_list_or_full(
            self.cpuset_mems.as_deref(),
            ListKind::Mems,
            topology.mem_node_count(),
        )?;

        let memory = validate_memory(
            self.memory_limit.unwrap_or(MEMORY_UNLIMITED),
            self.memory_soft_limit.unwrap_or(MEMORY_UNLIMITED),
            self.memory_swap_limit.unwrap_or(MEMORY_UNLIMITED),
        )?;

        Ok(ResourceLimits {
            cpu: CpuLimits {
                exceed_rate,
                cfs_period,
                cfs_quota,
                rt_period,
                rt_runtime,
                shares,
            },
            cpuset: CpusetLimits {
                cpus: cpuset_cpus,
                mems: cpuset_mems,
            },
            memory: MemoryLimits {
                swappiness: clamp_swappiness(self.memory_swappiness.unwrap_or(0)),
                ..memory
            },
            pids: PidsLimits {
                max: self.pids_max.unwrap_or(0),
            },
        })
    }
}

/// CPU controller values (microseconds, relative weight)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuLimits {
    pub exceed_rate: f64,
    pub cfs_period: u64,
    pub cfs_quota: u64,
    pub rt_period: u64,
    pub rt_runtime: u64,
    pub shares: u64,
}

/// Cpuset controller values
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpusetLimits {
    pub cpus: String,
    pub mems: String,
}

/// Memory controller values (bytes, -1 = unlimited)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryLimits {
    pub limit: i64,
    pub soft_limit: i64,
    pub swap_limit: i64,
    pub swappiness: u64,
}

/// Pids controller values (0 = unlimited)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PidsLimits {
    pub max: u64,
}

/// Validated, immutable limit set
///
/// Only built through [`LimitsSpec::validate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceLimits {
    cpu: CpuLimits,
    cpuset: CpusetLimits,
    memory: MemoryLimits,
    pids: PidsLimits,
}

impl ResourceLimits {
    pub fn cpu(&self) -> &CpuLimits {
        &self.cpu
    }

    pub fn cpuset(&self) -> &CpusetLimits {
        &self.cpuset
    }

    pub fn memory(&self) -> &MemoryLimits {
        &self.memory
    }

    pub fn pids(&self) -> &PidsLimits {
        &self.pids
    }
}

/// Which topology count bounds a cpuset list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Cpus,
    Mems,
}

impl ListKind {
    fn flag(&self) -> &'static str {
        match self {
            ListKind::Cpus => "cpuset-cpus",
            ListKind::Mems => "cpuset-mems",
        }
    }
}

fn invalid(msg: String) -> CgroupError {
    CgroupError::InvalidLimit(msg)
}

pub fn validate_exceed_rate(rate: f64) -> Result<f64> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(invalid(format!("cpu-exceed-rate must be positive, got {}", rate)));
    }
    Ok(rate)
}

/// CFS period: 0 (unset) or [1000, 1000000] microseconds
pub fn validate_cfs_period(period: u64) -> Result<u64> {
    if period != 0 && !(CFS_PERIOD_MIN..=CFS_PERIOD_MAX).contains(&period) {
        return Err(invalid(format!(
            "cpu-cfs-period requires [{}, {}], got {}",
            CFS_PERIOD_MIN, CFS_PERIOD_MAX, period
        )));
    }
    Ok(period)
}

/// Largest quota/runtime allowed for a period: period * cpus * rate
pub fn cpu_time_ceiling(period: u64, cpu_count: u64, exceed_rate: f64) -> u64 {
    (period.saturating_mul(cpu_count) as f64 * exceed_rate) as u64
}

pub fn validate_cfs_quota(quota: u64, period: u64, cpu_count: u64, exceed_rate: f64) -> Result<u64> {
    let ceiling = cpu_time_ceiling(period, cpu_count, exceed_rate);
    if quota > ceiling {
        return Err(invalid(format!(
            "cpu-cfs-quota {} exceeds period*cpus*exceed-rate ({})",
            quota, ceiling
        )));
    }
    Ok(quota)
}

pub fn validate_rt_period(period: u64) -> Result<u64> {
    if period > RT_PERIOD_MAX {
        return Err(invalid(format!(
            "cpu-rt-period can't exceed {}, got {}",
            RT_PERIOD_MAX, period
        )));
    }
    Ok(period)
}

pub fn validate_rt_runtime(
    runtime: u64,
    period: u64,
    cpu_count: u64,
    exceed_rate: f64,
) -> Result<u64> {
    let ceiling = cpu_time_ceiling(period, cpu_count, exceed_rate);
    if runtime > ceiling {
        return Err(invalid(format!(
            "cpu-rt-runtime {} exceeds period*cpus*exceed-rate ({})",
            runtime, ceiling
        )));
    }
    Ok(runtime)
}

/// Shares: 0 (unset) or at least 2
pub fn validate_shares(shares: u64) -> Result<u64> {
    if shares == 1 {
        return Err(invalid("cpu-shares requires >= 2".to_string()));
    }
    Ok(shares)
}

/// Validate a list such as `0-3,6` against `[0, max)`
pub fn validate_cpu_list(list: &str, kind: ListKind, max: u32) -> Result<()> {
    let range_error = || {
        invalid(format!(
            "{} requires a-b with a <= b, all values in the range [0, {}), got {:?}",
            kind.flag(),
            max,
            list
        ))
    };
    let parse = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|_| invalid(format!("{}: {:?} is not a number", kind.flag(), s)))
    };

    for item in list.split(',') {
        match item.split_once('-') {
            Some((a, b)) => {
                let (a, b) = (parse(a)?, parse(b)?);
                if a > b || b >= max {
                    return Err(range_error());
                }
            }
            None => {
                if parse(item)? >= max {
                    return Err(range_error());
                }
            }
        }
    }

    Ok(())
}

/// Full range list for `count` entries, e.g. `0-3`
pub fn full_range(count: u32) -> String {
    match count {
        0 | 1 => "0".to_string(),
        n => format!("0-{}", n - 1),
    }
}

/// Strip whitespace around list items and range bounds: `0, 2 - 3` -> `0,2-3`
pub fn normalize_cpu_list(list: &str) -> String {
    list.split(',')
        .map(|item| item.split('-').map(str::trim).collect::<Vec<_>>().join("-"))
        .collect::<Vec<_>>()
        .join(",")
}

fn cpu_list_or_full(list: Option<&str>, kind: ListKind, max: u32) -> Result<String> {
    match list.map(str::trim) {
        None | Some("") => Ok(full_range(max)),
        Some(list) => {
            let list = normalize_cpu_list(list);
            validate_cpu_list(&list, kind, max)?;
            Ok(list)
        }
    }
}

/// Memory limits: negatives collapse to -1; soft and swap must not undercut hard
pub fn validate_memory(limit: i64, soft_limit: i64, swap_limit: i64) -> Result<MemoryLimits> {
    let normalize = |v: i64| if v < 0 { MEMORY_UNLIMITED } else { v };
    let (limit, soft_limit, swap_limit) =
        (normalize(limit), normalize(soft_limit), normalize(swap_limit));

    if limit >= 0 && soft_limit >= 0 && soft_limit < limit {
        return Err(invalid(format!(
            "memory-soft-limit ({}) requires >= memory-limit ({})",
            soft_limit, limit
        )));
    }

    if limit >= 0 && swap_limit >= 0 && swap_limit < limit {
        return Err(invalid(format!(
            "memory-swap-limit ({}) requires >= memory-limit ({})",
            swap_limit, limit
        )));
    }

    Ok(MemoryLimits {
        limit,
        soft_limit,
        swap_limit,
        swappiness: 0,
    })
}

pub fn clamp_swappiness(swappiness: u64) -> u64 {
    swappiness.min(SWAPPINESS_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> HostTopology {
        HostTopology::new(4, 1)
    }

    #[test]
    fn test_cfs_period_bounds() {
        assert!(validate_cfs_period(0).is_ok());
        assert!(validate_cfs_period(1000).is_ok());
        assert!(validate_cfs_period(1_000_000).is_ok());
        assert!(validate_cfs_period(999).is_err());
        assert!(validate_cfs_period(1_000_001).is_err());
    }

    #[test]
    fn test_cfs_quota_ceiling() {
        assert_eq!(cpu_time_ceiling(200_000, 4, 2.5), 2_000_000);
        assert!(validate_cfs_quota(2_000_000, 200_000, 4, 2.5).is_ok());
        assert!(validate_cfs_quota(2_000_001, 200_000, 4, 2.5).is_err());
    }

    #[test]
    fn test_rt_limits() {
        assert!(validate_rt_period(2_000_000).is_ok());
        assert!(validate_rt_period(2_000_001).is_err());
        assert!(validate_rt_runtime(950_000, 1_000_000, 1, 1.0).is_ok());
        assert!(validate_rt_runtime(1_000_001, 1_000_000, 1, 1.0).is_err());
    }

    #[test]
    fn test_exceed_rate() {
        assert!(validate_exceed_rate(2.5).is_ok());
        assert!(validate_exceed_rate(0.0).is_err());
        assert!(validate_exceed_rate(-1.0).is_err());
        assert!(validate_exceed_rate(f64::NAN).is_err());
    }

    #[test]
    fn test_shares() {
        assert!(validate_shares(0).is_ok());
        assert!(validate_shares(1).is_err());
        assert!(validate_shares(2).is_ok());
        assert!(validate_shares(1024).is_ok());
    }

    #[test]
    fn test_cpu_list() {
        assert!(validate_cpu_list("0-3", ListKind::Cpus, 4).is_ok());
        assert!(validate_cpu_list("0,1,2", ListKind::Cpus, 3).is_ok());
        assert!(validate_cpu_list("0-1,3", ListKind::Cpus, 4).is_ok());
        assert!(validate_cpu_list("3-1", ListKind::Cpus, 4).is_err());
        assert!(validate_cpu_list("5", ListKind::Cpus, 4).is_err());
        assert!(validate_cpu_list("0-4", ListKind::Cpus, 4).is_err());
        assert!(validate_cpu_list("a", ListKind::Cpus, 4).is_err());
        assert!(validate_cpu_list("0,,1", ListKind::Cpus, 4).is_err());
        assert!(validate_cpu_list("-1", ListKind::Mems, 1).is_err());
    }

    #[test]
    fn test_cpu_list_whitespace_is_stripped() {
        assert_eq!(normalize_cpu_list("0, 2 - 3"), "0,2-3");
        assert_eq!(normalize_cpu_list("0-3"), "0-3");

        let spec = LimitsSpec {
            cpuset_cpus: Some(" 0, 1 ".to_string()),
            cpuset_mems: Some("0 ".to_string()),
            ..LimitsSpec::new()
        };
        let limits = spec.validate(&topology()).unwrap();
        assert_eq!(limits.cpuset().cpus, "0,1");
        assert_eq!(limits.cpuset().mems, "0");

        let spec = LimitsSpec {
            cpuset_cpus: Some("1 2".to_string()),
            ..LimitsSpec::new()
        };
        assert!(spec.validate(&topology()).is_err());
    }

    #[test]
    fn test_full_range() {
        assert_eq!(full_range(1), "0");
        assert_eq!(full_range(4), "0-3");
    }

    #[test]
    fn test_memory_ordering() {
        assert!(validate_memory(100, 50, -1).is_err());
        assert!(validate_memory(100, 150, -1).is_ok());
        assert!(validate_memory(-1, 50, -1).is_ok());
        assert!(validate_memory(100, -1, 99).is_err());
        assert!(validate_memory(100, -1, 100).is_ok());

        let mem = validate_memory(-5, -100, -2).unwrap();
        assert_eq!(mem.limit, MEMORY_UNLIMITED);
        assert_eq!(mem.soft_limit, MEMORY_UNLIMITED);
        assert_eq!(mem.swap_limit, MEMORY_UNLIMITED);
    }

    #[test]
    fn test_swappiness_clamped() {
        assert_eq!(clamp_swappiness(60), 60);
        assert_eq!(clamp_swappiness(250), 100);
    }

    #[test]
    fn test_defaults_validate() {
        let limits = LimitsSpec::new().validate(&topology()).unwrap();

        assert_eq!(limits.cpu().cfs_period, DEFAULT_CPU_CFS_PERIOD);
        assert_eq!(limits.cpu().cfs_quota, DEFAULT_CPU_CFS_QUOTA);
        assert_eq!(limits.cpu().rt_period, DEFAULT_CPU_RT_PERIOD);
        assert_eq!(limits.cpu().rt_runtime, DEFAULT_CPU_RT_RUNTIME);
        assert_eq!(limits.cpu().shares, DEFAULT_CPU_SHARES);
        assert_eq!(limits.cpuset().cpus, "0-3");
        assert_eq!(limits.cpuset().mems, "0");
        assert_eq!(limits.memory().limit, MEMORY_UNLIMITED);
        assert_eq!(limits.memory().swappiness, 0);
        assert_eq!(limits.pids().max, 0);
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let spec = LimitsSpec {
            cpu_cfs_period: Some(999),
            ..Default::default()
        };
        assert!(spec.validate(&topology()).is_err());

        let spec = LimitsSpec {
            cpuset_cpus: Some("5".to_string()),
            ..Default::default()
        };
        assert!(spec.validate(&topology()).is_err());

        let spec = LimitsSpec {
            memory_limit: Some(100),
            memory_soft_limit: Some(50),
            ..Default::default()
        };
        assert!(spec.validate(&topology()).is_err());

        let spec = LimitsSpec {
            cpu_exceed_rate: Some(0.0),
            ..Default::default()
        };
        assert!(spec.validate(&topology()).is_err());
    }

    #[test]
    fn test_validate_clamps_swappiness() {
        let spec = LimitsSpec {
            memory_swappiness: Some(400),
            memory_limit: Some(1 << 30),
            ..Default::default()
        };
        let limits = spec.validate(&topology()).unwrap();
        assert_eq!(limits.memory().swappiness, 100);
        assert_eq!(limits.memory().limit, 1 << 30);
    }

    #[test]
    fn test_merge_prefers_overrides() {
        let file = LimitsSpec {
            cpu_shares: Some(512),
            pids_max: Some(64),
            ..Default::default()
        };
        let flags = LimitsSpec {
            pids_max: Some(128),
            ..Default::default()
        };

        let merged = file.merge(flags);
        assert_eq!(merged.cpu_shares, Some(512));
        assert_eq!(merged.pids_max, Some(128));
    }

    #[test]
    fn test_spec_from_toml() {
        let spec: LimitsSpec = toml::from_str(
            r#"
            cpu_shares = 256
            cpuset_cpus = "0-1"
            memory_limit = 104857600
            "#,
        )
        .unwrap();

        assert_eq!(spec.cpu_shares, Some(256));
        assert_eq!(spec.cpuset_cpus.as_deref(), Some("0-1"));
        assert_eq!(spec.memory_limit, Some(104_857_600));
        assert_eq!(spec.pids_max, None);
    }
}
