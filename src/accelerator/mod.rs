use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum AcceleratorError {
    #[error(
        "Unknown accelerator: `{accelerator}`. GPUs: {gpus} (use 'xN' for multi-GPU, e.g. 'a100x4'). TPUs: {tpus} (use '-N' for chips, e.g. 'v3-8', or '-NxM' for topology, e.g. 'v5litepod-2x2')."
    )]
    UnknownAccelerator {
        accelerator: String,
        gpus: String,
        tpus: String,
    },
    #[error("GPU count {count} not supported for `{name}`. Supported: {supported}.")]
    UnsupportedGpuCount {
        name: String,
        count: u32,
        supported: String,
    },
    #[error("Chip count {chips} not supported for `{name}`. Supported: {supported}.")]
    UnsupportedChipCount {
        name: String,
        chips: u32,
        supported: String,
    },
}

/// Fully resolved GPU accelerator configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuConfig {
    /// "l4"
    pub name: &'static str,
    /// number of GPUs (1, 2, 4, …)
    pub count: u32,
    /// "nvidia-l4", K8s node selector value
    pub gke_label: &'static str,
    /// "g2-standard-4", GKE node pool machine type
    pub machine_type: &'static str,
}

/// Fully resolved TPU accelerator configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TpuConfig {
    /// "v5litepod"
    pub name: &'static str,
    /// number of TPU chips (4, 8, …)
    pub chips: u32,
    /// "2x2", TPU topology string
    pub topology: &'static str,
    /// "tpu-v5-lite-podslice"
    pub gke_accelerator: &'static str,
    /// "ct5lp-hightpu-4t"
    pub machine_type: &'static str,
    /// GKE node pool node count; > 1 means a multi-host slice
    pub num_nodes: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Accelerator {
    Cpu,
    Gpu(GpuConfig),
    Tpu(TpuConfig),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceleratorCategory {
    Cpu,
    Gpu,
    Tpu,
}

impl AcceleratorCategory {
    /// Value injected into every pod as `JAX_PLATFORMS`.
    pub fn jax_platform(&self) -> &'static str {
        match self {
            AcceleratorCategory::Cpu => "cpu",
            AcceleratorCategory::Gpu => "gpu",
            AcceleratorCategory::Tpu => "tpu",
        }
    }
}

impl Accelerator {
    pub fn category(&self) -> AcceleratorCategory {
        match self {
            Accelerator::Cpu => AcceleratorCategory::Cpu,
            Accelerator::Gpu(_) => AcceleratorCategory::Gpu,
            Accelerator::Tpu(_) => AcceleratorCategory::Tpu,
        }
    }

    /// True for TPU slices spanning more than one VM, which need gang
    /// scheduling and leader coordination.
    pub fn is_multi_host(&self) -> bool {
        matches!(self, Accelerator::Tpu(tpu) if tpu.num_nodes > 1)
    }
}

struct GpuSpec {
    name: &'static str,
    gke_label: &'static str,
    machine_type: &'static str,
    counts: &'static [u32],
}

// Each GPU entry maps to its GKE label, provisioning machine type and the
// set of supported multi-GPU counts.
const GPUS: &[GpuSpec] = &[
    GpuSpec {
        name: "l4",
        gke_label: "nvidia-l4",
        machine_type: "g2-standard-4",
        counts: &[1, 2, 4],
    },
    GpuSpec {
        name: "t4",
        gke_label: "nvidia-tesla-t4",
        machine_type: "n1-standard-4",
        counts: &[1, 2, 4],
    },
    GpuSpec {
        name: "v100",
        gke_label: "nvidia-tesla-v100",
        machine_type: "n1-standard-8",
        counts: &[1, 2, 4, 8],
    },
    GpuSpec {
        name: "a100",
        gke_label: "nvidia-tesla-a100",
        machine_type: "a2-highgpu-1g",
        counts: &[1, 2, 4, 8],
    },
    GpuSpec {
        name: "a100-80gb",
        gke_label: "nvidia-a100-80gb",
        machine_type: "a2-ultragpu-1g",
        counts: &[1, 2, 4, 8],
    },
    GpuSpec {
        name: "h100",
        gke_label: "nvidia-h100-80gb",
        machine_type: "a3-highgpu-1g",
        counts: &[1, 2, 4, 8],
    },
];

struct TpuTopologyRow {
    chips: u32,
    topology: &'static str,
    machine_type: &'static str,
    num_nodes: u32,
}

struct TpuSpec {
    name: &'static str,
    gke_accelerator: &'static str,
    default_chips: u32,
    topologies: &'static [TpuTopologyRow],
}

// Each TPU entry contains its GKE accelerator label, default chip count and
// one row per supported chip count (topology, machine type, node count).
const TPUS: &[TpuSpec] = &[
    TpuSpec {
        name: "v2",
        gke_accelerator: "tpu-v2-podslice",
        default_chips: 8,
        topologies: &[
            TpuTopologyRow {
                chips: 8,
                topology: "2x2",
                machine_type: "ct2-hightpu-4t",
                num_nodes: 2,
            },
            TpuTopologyRow {
                chips: 32,
                topology: "4x4",
                machine_type: "ct2-hightpu-4t",
                num_nodes: 8,
            },
        ],
    },
    TpuSpec {
        name: "v3",
        gke_accelerator: "tpu-v3-podslice",
        default_chips: 8,
        topologies: &[
            TpuTopologyRow {
                chips: 8,
                topology: "2x2",
                machine_type: "ct3p-hightpu-4t",
                num_nodes: 2,
            },
            TpuTopologyRow {
                chips: 32,
                topology: "4x4",
                machine_type: "ct3p-hightpu-4t",
                num_nodes: 8,
            },
        ],
    },
    TpuSpec {
        name: "v5litepod",
        gke_accelerator: "tpu-v5-lite-podslice",
        default_chips: 4,
        topologies: &[
            TpuTopologyRow {
                chips: 1,
                topology: "1x1",
                machine_type: "ct5lp-hightpu-1t",
                num_nodes: 1,
            },
            TpuTopologyRow {
                chips: 4,
                topology: "2x2",
                machine_type: "ct5lp-hightpu-4t",
                num_nodes: 1,
            },
            TpuTopologyRow {
                chips: 8,
                topology: "2x4",
                machine_type: "ct5lp-hightpu-8t",
                num_nodes: 1,
            },
        ],
    },
    TpuSpec {
        name: "v5p",
        gke_accelerator: "tpu-v5p-slice",
        default_chips: 8,
        topologies: &[
            TpuTopologyRow {
                chips: 8,
                topology: "2x2",
                machine_type: "ct5p-hightpu-4t",
                num_nodes: 2,
            },
            TpuTopologyRow {
                chips: 16,
                topology: "2x4",
                machine_type: "ct5p-hightpu-4t",
                num_nodes: 4,
            },
        ],
    },
    TpuSpec {
        name: "v6e",
        gke_accelerator: "tpu-v6e-slice",
        default_chips: 8,
        topologies: &[
            TpuTopologyRow {
                chips: 8,
                topology: "2x2",
                machine_type: "ct6e-standard-4t",
                num_nodes: 2,
            },
            TpuTopologyRow {
                chips: 16,
                topology: "2x4",
                machine_type: "ct6e-standard-4t",
                num_nodes: 4,
            },
        ],
    },
];

static MULTI_GPU_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+?)x(\d+)$").expect("invalid multi-GPU regex")); // "a100x4"
static TPU_CHIPS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(v\d+\w*)-(\d+)$").expect("invalid TPU chips regex")); // "v3-8"
static TPU_TOPO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(v\d+\w*)-(\d+x\d+)$").expect("invalid TPU topology regex")); // "v5litepod-2x2"

/// Parse an accelerator string into a fully resolved descriptor.
///
/// Accepted formats:
///   GPU:  "l4", "nvidia-l4", "a100x4", "a100-80gbx8"
///   TPU:  "v3-8" (chip count), "v5litepod-2x2" (topology), "v5litepod" (default)
///   CPU:  "cpu"
pub fn parse_accelerator(accelerator: &str) -> Result<Accelerator, AcceleratorError> {
    let s = accelerator.trim().to_lowercase();

    if s == "cpu" {
        return Ok(Accelerator::Cpu);
    }

    // Direct GPU name: "l4", "a100-80gb"
    if let Some(spec) = gpu_by_name(&s) {
        return make_gpu(spec, 1);
    }

    // GPU alias: "nvidia-l4"
    if let Some(spec) = gpu_by_label(&s) {
        return make_gpu(spec, 1);
    }

    // Multi-GPU: "a100x4", "l4x2"
    if let Some(captures) = MULTI_GPU_RE.captures(&s) {
        let name = &captures[1];
        let count: u32 = captures[2].parse().unwrap_or(0);
        if let Some(spec) = gpu_by_name(name).or_else(|| gpu_by_label(name)) {
            return make_gpu(spec, count);
        }
    }

    // Direct TPU name (bare): "v5litepod" -> default chips
    if let Some(spec) = tpu_by_name(&s) {
        return make_tpu(spec, spec.default_chips);
    }

    // TPU with topology string: "v5litepod-2x2"
    if let Some(captures) = TPU_TOPO_RE.captures(&s) {
        if let Some(spec) = tpu_by_name(&captures[1]) {
            let topology = &captures[2];
            if let Some(row) = spec.topologies.iter().find(|row| row.topology == topology) {
                return make_tpu(spec, row.chips);
            }
        }
    }

    // TPU with chip count: "v3-8", "v5litepod-4"
    if let Some(captures) = TPU_CHIPS_RE.captures(&s) {
        if let Some(spec) = tpu_by_name(&captures[1]) {
            let chips: u32 = captures[2].parse().unwrap_or(0);
            return make_tpu(spec, chips);
        }
    }

    Err(AcceleratorError::UnknownAccelerator {
        accelerator: accelerator.to_string(),
        gpus: GPUS.iter().map(|g| g.name).collect::<Vec<_>>().join(", "),
        tpus: TPUS.iter().map(|t| t.name).collect::<Vec<_>>().join(", "),
    })
}

fn gpu_by_name(name: &str) -> Option<&'static GpuSpec> {
    GPUS.iter().find(|spec| spec.name == name)
}

fn gpu_by_label(label: &str) -> Option<&'static GpuSpec> {
    GPUS.iter().find(|spec| spec.gke_label == label)
}

fn tpu_by_name(name: &str) -> Option<&'static TpuSpec> {
    TPUS.iter().find(|spec| spec.name == name)
}

fn make_gpu(spec: &'static GpuSpec, count: u32) -> Result<Accelerator, AcceleratorError> {
    if !spec.counts.contains(&count) {
        return Err(AcceleratorError::UnsupportedGpuCount {
            name: spec.name.to_string(),
            count,
            supported: spec.counts.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(", "),
        });
    }

    Ok(Accelerator::Gpu(GpuConfig {
        name: spec.name,
        count,
        gke_label: spec.gke_label,
        machine_type: spec.machine_type,
    }))
}

fn make_tpu(spec: &'static TpuSpec, chips: u32) -> Result<Accelerator, AcceleratorError> {
    let row = match spec.topologies.iter().find(|row| row.chips == chips) {
        Some(row) => row,
        None => {
            return Err(AcceleratorError::UnsupportedChipCount {
                name: spec.name.to_string(),
                chips,
                supported: spec
                    .topologies
                    .iter()
                    .map(|row| row.chips.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
    };

    Ok(Accelerator::Tpu(TpuConfig {
        name: spec.name,
        chips,
        topology: row.topology,
        gke_accelerator: spec.gke_accelerator,
        machine_type: row.machine_type,
        num_nodes: row.num_nodes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu() {
        assert_eq!(parse_accelerator("cpu"), Ok(Accelerator::Cpu));
        assert_eq!(parse_accelerator(" CPU "), Ok(Accelerator::Cpu));
    }

    #[test]
    fn test_parse_gpu_by_name_and_label() {
        let by_name = parse_accelerator("l4").expect("l4 should parse");
        let by_label = parse_accelerator("nvidia-l4").expect("nvidia-l4 should parse");
        assert_eq!(by_name, by_label);

        match by_name {
            Accelerator::Gpu(gpu) => {
                assert_eq!(gpu.name, "l4");
                assert_eq!(gpu.count, 1);
                assert_eq!(gpu.gke_label, "nvidia-l4");
                assert_eq!(gpu.machine_type, "g2-standard-4");
            }
            other => panic!("expected GPU, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_multi_gpu() {
        match parse_accelerator("a100x4").expect("a100x4 should parse") {
            Accelerator::Gpu(gpu) => {
                assert_eq!(gpu.name, "a100");
                assert_eq!(gpu.count, 4);
            }
            other => panic!("expected GPU, got {other:?}"),
        }

        // "a100-80gbx8": dashed name combined with a count suffix
        match parse_accelerator("a100-80gbx8").expect("a100-80gbx8 should parse") {
            Accelerator::Gpu(gpu) => {
                assert_eq!(gpu.name, "a100-80gb");
                assert_eq!(gpu.count, 8);
            }
            other => panic!("expected GPU, got {other:?}"),
        }

        assert!(matches!(
            parse_accelerator("l4x8"),
            Err(AcceleratorError::UnsupportedGpuCount { .. })
        ));
    }

    #[test]
    fn test_parse_tpu_chip_count() {
        match parse_accelerator("v3-8").expect("v3-8 should parse") {
            Accelerator::Tpu(tpu) => {
                assert_eq!(tpu.name, "v3");
                assert_eq!(tpu.chips, 8);
                assert_eq!(tpu.topology, "2x2");
                assert_eq!(tpu.gke_accelerator, "tpu-v3-podslice");
                assert_eq!(tpu.num_nodes, 2);
            }
            other => panic!("expected TPU, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_tpu_topology_and_default() {
        let by_topology = parse_accelerator("v5litepod-2x2").expect("v5litepod-2x2 should parse");
        let by_default = parse_accelerator("v5litepod").expect("v5litepod should parse");
        assert_eq!(by_topology, by_default);

        match by_default {
            Accelerator::Tpu(tpu) => {
                assert_eq!(tpu.chips, 4);
                assert_eq!(tpu.num_nodes, 1);
            }
            other => panic!("expected TPU, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown() {
        let err = parse_accelerator("warp-drive").unwrap_err();
        assert!(matches!(err, AcceleratorError::UnknownAccelerator { .. }));
        assert!(err.to_string().contains("v5litepod"));

        assert!(matches!(
            parse_accelerator("v3-7"),
            Err(AcceleratorError::UnsupportedChipCount { .. })
        ));
    }

    #[test]
    fn test_category_and_multi_host() {
        assert_eq!(parse_accelerator("cpu").unwrap().category().jax_platform(), "cpu");
        assert_eq!(parse_accelerator("l4").unwrap().category().jax_platform(), "gpu");
        assert_eq!(parse_accelerator("v3-8").unwrap().category().jax_platform(), "tpu");

        assert!(parse_accelerator("v3-8").unwrap().is_multi_host());
        assert!(!parse_accelerator("v5litepod-4").unwrap().is_multi_host());
        assert!(!parse_accelerator("a100x4").unwrap().is_multi_host());
    }
}
