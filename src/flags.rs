//! Export flags, size and block-size constraints.
//!
//! These accessors answer questions about the negotiated export. They all
//! refuse with `EINVAL` until the handshake has delivered the relevant
//! datum; export size and flags arrive together, so a non-empty flag word
//! is the validity marker for both.

use log::debug;
use nix::errno::Errno;

use crate::errors::{set_context, set_error, Result};
use crate::handle::{BlockSizeKind, Handle};
use crate::proto::{TransmitFlags, MAX_REQUEST_SIZE};

impl Handle {
    /// Set the export size and flags, validating them. Called from the
    /// state machine when either the newstyle or oldstyle negotiation
    /// reaches the point where these are available.
    pub(crate) fn set_size_and_flags(&mut self, exportsize: u64, eflags: u16) -> Result<()> {
        debug!(target: "nbd", "{}: exportsize: {exportsize} eflags: {eflags:#x}", self.hname);

        if eflags == 0 {
            return Err(set_error(
                Errno::EINVAL,
                "handshake: invalid eflags == 0 from server",
            ));
        }
        let mut eflags = TransmitFlags::from_bits_truncate(eflags);

        if eflags.contains(TransmitFlags::SEND_DF) && !self.structured_replies {
            debug!(target: "nbd", "{}: server lacks structured replies, ignoring claim of df", self.hname);
            eflags.remove(TransmitFlags::SEND_DF);
        }

        if eflags.contains(TransmitFlags::SEND_FAST_ZERO)
            && !eflags.contains(TransmitFlags::SEND_WRITE_ZEROES)
        {
            debug!(target: "nbd", "{}: server lacks write zeroes, ignoring claim of fast zero", self.hname);
            eflags.remove(TransmitFlags::SEND_FAST_ZERO);
        }

        if self.request_meta && (!self.structured_replies || self.request_meta_contexts.is_empty())
        {
            // SET_META_CONTEXT was skipped; an empty set is the valid answer.
            self.meta_valid = true;
        }

        self.exportsize = exportsize;
        self.eflags = eflags;
        Ok(())
    }

    /// Record the server's advertised block size constraints, validating
    /// them. A non-conforming advertisement is ignored (with a debug
    /// message) rather than rejected, and the defaults stay in place.
    pub(crate) fn set_block_size(&mut self, min: u32, pref: u32, max: u32) {
        debug!(
            target: "nbd",
            "{}: server block size constraints: min: {min} preferred: {pref} max: {max}",
            self.hname
        );
        // The protocol requires:
        //   min and pref are powers of 2
        //   min <= MIN(pref, 64k)
        //   pref >= 512
        //   max is either a multiple of min or 0xffffffff
        let ok = min != 0
            && min <= 64 * 1024
            && min <= pref
            && pref >= 512
            && pref <= max
            && min.is_power_of_two()
            && pref.is_power_of_two()
            && (max == 0xffff_ffff || max % min == 0);
        if !ok {
            debug!(target: "nbd", "{}: ignoring improper server size constraints", self.hname);
            return;
        }
        self.block_minimum = min;
        self.block_preferred = pref;
        self.block_maximum = max;
    }

    /// Derive the maximum payload for one request, once all other export
    /// information is in. Without an advertisement the protocol allows us
    /// to assume no more than 32M; with one we clamp between 1M and the
    /// biggest buffer we are willing to allocate.
    pub(crate) fn set_payload_maximum(&mut self) {
        self.payload_maximum = if self.block_maximum != 0 {
            MAX_REQUEST_SIZE.min(self.block_maximum.max(1024 * 1024))
        } else {
            32 * 1024 * 1024
        };
    }

    fn get_flag(&self, flag: TransmitFlags) -> Result<bool> {
        if self.eflags.is_empty() {
            return Err(set_error(
                Errno::EINVAL,
                "server has not returned export flags, you need to connect to the server first",
            ));
        }
        Ok(self.eflags.contains(flag))
    }

    /// Size of the export in bytes, as reported during the handshake.
    pub fn get_size(&self) -> Result<u64> {
        set_context("nbd_get_size");
        if self.eflags.is_empty() {
            return Err(set_error(
                Errno::EINVAL,
                "server has not returned export size, you need to connect to the server first",
            ));
        }
        Ok(self.exportsize)
    }

    pub fn is_read_only(&self) -> Result<bool> {
        set_context("nbd_is_read_only");
        self.get_flag(TransmitFlags::READ_ONLY)
    }

    pub fn is_rotational(&self) -> Result<bool> {
        set_context("nbd_is_rotational");
        self.get_flag(TransmitFlags::ROTATIONAL)
    }

    pub fn can_flush(&self) -> Result<bool> {
        set_context("nbd_can_flush");
        self.get_flag(TransmitFlags::SEND_FLUSH)
    }

    pub fn can_fua(&self) -> Result<bool> {
        set_context("nbd_can_fua");
        self.get_flag(TransmitFlags::SEND_FUA)
    }

    pub fn can_trim(&self) -> Result<bool> {
        set_context("nbd_can_trim");
        self.get_flag(TransmitFlags::SEND_TRIM)
    }

    pub fn can_zero(&self) -> Result<bool> {
        set_context("nbd_can_zero");
        self.get_flag(TransmitFlags::SEND_WRITE_ZEROES)
    }

    pub fn can_fast_zero(&self) -> Result<bool> {
        set_context("nbd_can_fast_zero");
        self.get_flag(TransmitFlags::SEND_FAST_ZERO)
    }

    pub fn can_df(&self) -> Result<bool> {
        set_context("nbd_can_df");
        self.get_flag(TransmitFlags::SEND_DF)
    }

    pub fn can_multi_conn(&self) -> Result<bool> {
        set_context("nbd_can_multi_conn");
        self.get_flag(TransmitFlags::CAN_MULTI_CONN)
    }

    pub fn can_cache(&self) -> Result<bool> {
        set_context("nbd_can_cache");
        self.get_flag(TransmitFlags::SEND_CACHE)
    }

    /// Whether `name` was negotiated with the server and can be used with
    /// `block_status`.
    pub fn can_meta_context(&self, name: &str) -> Result<bool> {
        set_context("nbd_can_meta_context");
        if !self.request_meta_contexts.is_empty() && !self.meta_valid {
            return Err(set_error(
                Errno::EINVAL,
                "need a successful server meta context request first",
            ));
        }
        Ok(self.meta_contexts.iter().any(|mc| mc.name == name))
    }

    /// One of the advertised block size constraints, or 0 when the server
    /// sent none (for `Payload`, the derived value is always available once
    /// connected).
    pub fn get_block_size(&self, kind: BlockSizeKind) -> Result<u32> {
        set_context("nbd_get_block_size");
        if self.eflags.is_empty() {
            return Err(set_error(
                Errno::EINVAL,
                "server has not returned export flags, you need to connect to the server first",
            ));
        }
        Ok(match kind {
            BlockSizeKind::Minimum => self.block_minimum,
            BlockSizeKind::Preferred => self.block_preferred,
            BlockSizeKind::Maximum => self.block_maximum,
            BlockSizeKind::Payload => self.payload_maximum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::MetaContext;

    fn connected_handle(eflags: TransmitFlags) -> Handle {
        let mut h = Handle::new();
        h.structured_replies = true;
        h.set_size_and_flags(1 << 20, eflags.bits()).unwrap();
        h
    }

    #[test]
    fn flags_require_connection() {
        let h = Handle::new();
        assert_eq!(h.get_size().unwrap_err().errno(), Some(Errno::EINVAL));
        assert_eq!(h.can_trim().unwrap_err().errno(), Some(Errno::EINVAL));
    }

    #[test]
    fn zero_eflags_rejected() {
        let mut h = Handle::new();
        let err = h.set_size_and_flags(1 << 20, 0).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EINVAL));
    }

    #[test]
    fn flag_accessors() {
        let h = connected_handle(
            TransmitFlags::HAS_FLAGS | TransmitFlags::SEND_FLUSH | TransmitFlags::SEND_TRIM,
        );
        assert_eq!(h.get_size().unwrap(), 1 << 20);
        assert!(h.can_flush().unwrap());
        assert!(h.can_trim().unwrap());
        assert!(!h.can_zero().unwrap());
        assert!(!h.is_read_only().unwrap());
    }

    #[test]
    fn df_requires_structured_replies() {
        let mut h = Handle::new();
        h.structured_replies = false;
        h.set_size_and_flags(
            1 << 20,
            (TransmitFlags::HAS_FLAGS | TransmitFlags::SEND_DF).bits(),
        )
        .unwrap();
        assert!(!h.can_df().unwrap());

        let h = connected_handle(TransmitFlags::HAS_FLAGS | TransmitFlags::SEND_DF);
        assert!(h.can_df().unwrap());
    }

    #[test]
    fn fast_zero_requires_write_zeroes() {
        let h = connected_handle(TransmitFlags::HAS_FLAGS | TransmitFlags::SEND_FAST_ZERO);
        assert!(!h.can_fast_zero().unwrap());

        let h = connected_handle(
            TransmitFlags::HAS_FLAGS
                | TransmitFlags::SEND_WRITE_ZEROES
                | TransmitFlags::SEND_FAST_ZERO,
        );
        assert!(h.can_fast_zero().unwrap());
    }

    #[test]
    fn block_size_validation() {
        let cases: &[(u32, u32, u32, bool)] = &[
            (512, 4096, 1 << 25, true),
            (1, 512, 0xffff_ffff, true),
            (0, 4096, 1 << 25, false),        // zero min
            (512, 256, 1 << 25, false),       // pref < 512
            (768, 4096, 1 << 25, false),      // min not a power of two
            (512, 3072, 1 << 25, false),      // pref not a power of two
            (128 * 1024, 128 * 1024, 1 << 25, false), // min > 64K
            (4096, 512, 1 << 25, false),      // min > pref
            (512, 4096, 2048, false),         // pref > max
            (512, 4096, 10000, false),        // max not a multiple of min
        ];
        for &(min, pref, max, accepted) in cases {
            let mut h = Handle::new();
            h.set_block_size(min, pref, max);
            let got = h.block_minimum != 0;
            assert_eq!(
                got, accepted,
                "constraints ({min},{pref},{max}) acceptance mismatch"
            );
        }
    }

    #[test]
    fn block_size_accepted_multiple() {
        // 12288 is a multiple of 512, so this advertisement is fine
        let mut h = Handle::new();
        h.set_block_size(512, 4096, 4096 * 3);
        assert_eq!(h.block_minimum, 512);
    }

    #[test]
    fn payload_maximum_derivation() {
        let mut h = Handle::new();
        h.set_payload_maximum();
        assert_eq!(h.payload_maximum, 32 * 1024 * 1024);

        h.block_maximum = 4096;
        h.set_payload_maximum();
        assert_eq!(h.payload_maximum, 1024 * 1024);

        h.block_maximum = 1 << 27; // 128M advertised, clamp to 64M
        h.set_payload_maximum();
        assert_eq!(h.payload_maximum, 64 * 1024 * 1024);

        h.block_maximum = 2 * 1024 * 1024;
        h.set_payload_maximum();
        assert_eq!(h.payload_maximum, 2 * 1024 * 1024);
    }

    #[test]
    fn meta_context_lookup() {
        let mut h = connected_handle(TransmitFlags::HAS_FLAGS);
        h.request_meta_contexts.push("base:allocation".into());
        // not valid until SET_META_CONTEXT succeeded
        assert!(h.can_meta_context("base:allocation").is_err());
        h.meta_valid = true;
        h.meta_contexts.push(MetaContext {
            name: "base:allocation".into(),
            context_id: 5,
        });
        assert!(h.can_meta_context("base:allocation").unwrap());
        assert!(!h.can_meta_context("qemu:dirty-bitmap:x").unwrap());
    }
}
