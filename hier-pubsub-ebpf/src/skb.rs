//! `PacketBuf` over the TC skb.
//!
//! Loads and stores go through `bpf_skb_load_bytes` / `bpf_skb_store_bytes`
//! (`ctx.load` / `ctx.store`) rather than direct packet pointers, which keeps
//! the verifier happy with the variable UDP offset.

use aya_ebpf::programs::TcContext;
use hier_pubsub_common::{BufError, PacketBuf};

pub struct SkbPacket<'a> {
    ctx: &'a mut TcContext,
}

impl<'a> SkbPacket<'a> {
    pub fn new(ctx: &'a mut TcContext) -> Self {
        Self { ctx }
    }
}

impl PacketBuf for SkbPacket<'_> {
    #[inline(always)]
    fn linear_len(&self) -> usize {
        self.ctx.data_end() - self.ctx.data()
    }

    #[inline(always)]
    fn pull(&mut self, len: usize) -> Result<(), BufError> {
        self.ctx.pull_data(len as u32).map_err(|_| BufError)
    }

    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Result<[u8; N], BufError> {
        self.ctx.load::<[u8; N]>(offset).map_err(|_| BufError)
    }

    #[inline(always)]
    fn store<const N: usize>(&mut self, offset: usize, bytes: &[u8; N]) -> Result<(), BufError> {
        self.ctx.store(offset, bytes, 0).map_err(|_| BufError)
    }

    #[inline(always)]
    fn clone_redirect(&mut self, ifindex: u32) -> Result<(), BufError> {
        self.ctx.clone_redirect(ifindex, 0).map_err(|_| BufError)
    }
}
