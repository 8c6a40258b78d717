//! eBPF program lifecycle manager.
//!
//! Loads the compiled TC eBPF program, attaches it to TC ingress, and gives the
//! controller typed write access to the config record and both table
//! generations. Handles cleanup on shutdown.

use anyhow::{Context, Result};
use aya::maps::{Array, HashMap, MapData, MapError, PerCpuArray};
use aya::programs::{tc, SchedClassifier, TcAttachType};
use aya::Ebpf;
use tracing::{debug, info, warn};

use crate::tables::{check_local_set, check_node_set, TableWriter};
use hier_pubsub_common::*;

/// Manages the lifecycle of the TC program and its maps.
pub struct EbpfManager {
    bpf: Ebpf,
    attached_interface: Option<String>,
}

impl EbpfManager {
    /// Load the eBPF program from its compiled ELF bytes.
    pub fn load(ebpf_bytes: &[u8]) -> Result<Self> {
        let mut bpf = Ebpf::load(ebpf_bytes).context("loading eBPF program")?;

        if let Err(e) = aya_log::EbpfLogger::init(&mut bpf) {
            warn!("eBPF logging not available: {}", e);
        }

        if bpf.map(MAP_EVENTS).is_none() {
            warn!("{} ring buffer missing from eBPF object", MAP_EVENTS);
        }

        Ok(Self {
            bpf,
            attached_interface: None,
        })
    }

    /// Attach the classifier to TC ingress on `iface`.
    ///
    /// The classifier passes everything through untouched until the first
    /// config record is written.
    pub fn attach(&mut self, iface: &str) -> Result<()> {
        // EEXIST is fine.
        if let Err(e) = tc::qdisc_add_clsact(iface) {
            let msg = format!("{}", e);
            if !msg.contains("exist") {
                return Err(e).context("adding clsact qdisc");
            }
        }

        let program: &mut SchedClassifier = self
            .bpf
            .program_mut(PROGRAM_NAME)
            .with_context(|| format!("eBPF program '{}' not found", PROGRAM_NAME))?
            .try_into()
            .context("program type mismatch (expected SchedClassifier)")?;

        program.load().context("loading TC program")?;
        program
            .attach(iface, TcAttachType::Ingress)
            .context("attaching to TC ingress")?;

        info!(interface = iface, "attached TC eBPF program to ingress");
        self.attached_interface = Some(iface.to_string());

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Private: Map Access
    // -----------------------------------------------------------------------

    fn array_mut<T: aya::Pod>(&mut self, name: &str) -> Result<Array<&mut MapData, T>> {
        self.bpf
            .map_mut(name)
            .with_context(|| format!("{} map not found", name))?
            .try_into()
            .with_context(|| format!("{} map type mismatch", name))
    }
}

impl TableWriter for EbpfManager {
    fn read_config(&self) -> Result<Option<ConfigRecord>> {
        let map: HashMap<_, u32, ConfigRecord> = self
            .bpf
            .map(MAP_CONFIG)
            .context("CONFIG map not found")?
            .try_into()
            .context("CONFIG map type mismatch")?;

        match map.get(&0, 0) {
            Ok(cfg) => Ok(Some(cfg)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(e).context("reading CONFIG entry"),
        }
    }

    fn write_config(&mut self, cfg: ConfigRecord) -> Result<()> {
        let mut map: HashMap<_, u32, ConfigRecord> = self
            .bpf
            .map_mut(MAP_CONFIG)
            .context("CONFIG map not found")?
            .try_into()
            .context("CONFIG map type mismatch")?;

        map.insert(0, cfg, 0).context("writing CONFIG entry")?;

        debug!(
            egress_ifindex = cfg.egress_ifindex,
            local_route_ifindex = cfg.local_route_ifindex,
            local_node_id = cfg.local_node_id,
            active_gen = cfg.active_gen,
            "wrote config record"
        );
        Ok(())
    }

    fn write_node_set(
        &mut self,
        gen: Generation,
        topic_id: u32,
        nodes: &[NodeDest],
    ) -> Result<()> {
        check_node_set(topic_id, nodes.len())?;

        let mut entries: Array<_, NodeDest> = self.array_mut(MAP_TOPIC_NODES[gen.index()])?;
        let base = topic_id * MAX_FANOUT;
        for (i, nd) in nodes.iter().enumerate() {
            let idx = base + i as u32;
            entries
                .set(idx, *nd, 0)
                .with_context(|| format!("updating node entry idx={}", idx))?;
        }

        let mut count: Array<_, u32> = self.array_mut(MAP_TOPIC_FANOUT[gen.index()])?;
        count
            .set(topic_id, nodes.len() as u32, 0)
            .context("updating topic fanout count")?;

        Ok(())
    }

    fn write_local_set(&mut self, gen: Generation, node_id: u32, subs: &[SubDest]) -> Result<()> {
        check_local_set(node_id, subs.len())?;

        let mut entries: Array<_, SubDest> = self.array_mut(MAP_LOCAL_SUBS[gen.index()])?;
        let base = node_id * MAX_LOCAL_SUB;
        for (i, sd) in subs.iter().enumerate() {
            let idx = base + i as u32;
            entries
                .set(idx, *sd, 0)
                .with_context(|| format!("updating subscriber entry idx={}", idx))?;
        }

        let mut count: Array<_, u32> = self.array_mut(MAP_LOCAL_FANOUT[gen.index()])?;
        count
            .set(node_id, subs.len() as u32, 0)
            .context("updating local fanout count")?;

        Ok(())
    }

    /// Detach the TC program. Called on shutdown.
    fn detach(&mut self) -> Result<()> {
        info!("detaching eBPF program");

        if let Some(iface) = self.attached_interface.take() {
            if let Err(e) = tc::qdisc_detach_program(&iface, TcAttachType::Ingress, PROGRAM_NAME)
            {
                warn!(interface = %iface, error = %e, "failed to detach TC program");
            }
        }

        Ok(())
    }

    fn read_metrics(&self) -> Result<Metrics> {
        let map: PerCpuArray<_, Metrics> = self
            .bpf
            .map(MAP_METRICS)
            .context("METRICS map not found")?
            .try_into()
            .context("METRICS map type mismatch")?;

        let per_cpu = map.get(&0, 0).context("reading METRICS entry")?;

        let mut agg = Metrics::default();
        for entry in per_cpu.iter() {
            agg.merge(entry);
        }
        Ok(agg)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Get the interface index for a network interface name.
pub fn interface_index(iface: &str) -> Result<u32> {
    let idx = nix::net::if_::if_nametoindex(iface)
        .with_context(|| format!("interface '{}' not found", iface))?;
    Ok(idx)
}
