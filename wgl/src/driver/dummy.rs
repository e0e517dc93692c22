//! Dummy driver for testing and development.
//!
//! This driver doesn't talk to any GPU. Contexts, pbuffers and buffers are
//! plain in-memory records, which is enough to exercise the handle table,
//! the binding protocol and buffer mapping without real hardware.
//!
//! Buffer maps hand out pointers into the buffer's backing `Vec`. With
//! [`DummyDriver::with_unrepresentable_mappings`] every direct map is reported
//! as unrepresentable instead, forcing callers through the copy protocol.
//!
//! Buffers made with [`DummyDriver::create_buffer`] are visible from every
//! context. [`DummyDriver::create_context_buffer`] gives one context its own
//! buffer under a key, the way a target binding differs per context; it
//! shadows the shared buffer while that context is current.

use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use super::{
    BufferKey, ContextAttrib, DebugMessage, DebugSink, DeviceContext, Driver, DriverContext,
    DriverPbuffer, MapAccess, MapOutcome, MapRequest, MapTransfer, MappedPtr, PbufferAttribute,
    UnmapOutcome, UnmapTransfer,
};
use crate::error::DriverError;

/// Surfaces handed out for pbuffers live above this value.
const PBUFFER_DC_BASE: u64 = 1 << 32;

struct DummyContext {
    dc: DeviceContext,
    core: bool,
    shares: Vec<DriverContext>,
    copied_from: Option<(DriverContext, u32)>,
    debug_sink: Option<DebugSink>,
}

struct DummyPbuffer {
    width: i32,
    height: i32,
    dc_acquired: bool,
}

struct DummyMapping {
    offset: usize,
    length: usize,
    access: MapAccess,
    /// Pointer handed to the caller, `None` while a copy retry is pending.
    caller_ptr: Option<MappedPtr>,
    copied: bool,
}

struct DummyBuffer {
    data: Vec<u8>,
    mapping: Option<DummyMapping>,
}

/// Owning context (`None` for shared buffers) and key.
type BufferSlot = (Option<DriverContext>, BufferKey);

#[derive(Default)]
struct DummyState {
    next_id: u64,
    contexts: HashMap<DriverContext, DummyContext>,
    pbuffers: HashMap<DriverPbuffer, DummyPbuffer>,
    buffers: HashMap<BufferSlot, DummyBuffer>,
    current: HashMap<ThreadId, DriverContext>,
    fail_next_make_current: Option<DriverError>,
    fail_next_delete: Option<DriverError>,
    make_current_calls: usize,
}

impl DummyState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn require_current(&self) -> Result<(), DriverError> {
        if self.current.contains_key(&thread::current().id()) {
            Ok(())
        } else {
            Err(DriverError::Failed("no current context".into()))
        }
    }

    /// Resolve `key` in the context current on the calling thread.
    fn buffer_slot(&self, key: BufferKey) -> BufferSlot {
        match self.current.get(&thread::current().id()) {
            Some(&ctx) if self.buffers.contains_key(&(Some(ctx), key)) => (Some(ctx), key),
            _ => (None, key),
        }
    }

    fn insert_buffer(&mut self, slot: BufferSlot, contents: &[u8]) {
        self.buffers.insert(
            slot,
            DummyBuffer {
                data: contents.to_vec(),
                mapping: None,
            },
        );
    }
}

/// In-memory driver.
pub struct DummyDriver {
    extensions: Vec<String>,
    unrepresentable: bool,
    state: Mutex<DummyState>,
}

impl DummyDriver {
    /// Create a new dummy driver.
    pub fn new() -> Self {
        Self {
            extensions: Vec::new(),
            unrepresentable: false,
            state: Mutex::new(DummyState::default()),
        }
    }

    /// Set the advertised extension list.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Report every direct map as unrepresentable in the caller's address space.
    pub fn with_unrepresentable_mappings(mut self) -> Self {
        self.unrepresentable = true;
        self
    }

    /// Create or replace a shared buffer with the given contents.
    pub fn create_buffer(&self, key: BufferKey, contents: &[u8]) {
        log::trace!("DummyDriver: creating buffer {:?} ({} bytes)", key, contents.len());
        self.state.lock().insert_buffer((None, key), contents);
    }

    /// Create or replace a buffer only `ctx` sees under `key`.
    pub fn create_context_buffer(&self, ctx: DriverContext, key: BufferKey, contents: &[u8]) {
        log::trace!(
            "DummyDriver: creating buffer {:?} in {:?} ({} bytes)",
            key,
            ctx,
            contents.len()
        );
        self.state.lock().insert_buffer((Some(ctx), key), contents);
    }

    /// Get a copy of a shared buffer's contents.
    pub fn buffer_contents(&self, key: BufferKey) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&(None, key)).map(|b| b.data.clone())
    }

    /// Get a copy of the contents of a buffer owned by `ctx`.
    pub fn context_buffer_contents(&self, ctx: DriverContext, key: BufferKey) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(&(Some(ctx), key))
            .map(|b| b.data.clone())
    }

    /// Whether a shared buffer currently has an active mapping.
    pub fn is_mapped(&self, key: BufferKey) -> bool {
        self.state
            .lock()
            .buffers
            .get(&(None, key))
            .is_some_and(|b| b.mapping.is_some())
    }

    /// Make the next bind (not unbind) call fail with `error`.
    pub fn fail_next_make_current(&self, error: DriverError) {
        self.state.lock().fail_next_make_current = Some(error);
    }

    /// Make the next context deletion fail with `error`.
    pub fn fail_next_delete(&self, error: DriverError) {
        self.state.lock().fail_next_delete = Some(error);
    }

    /// Number of `make_current` calls received, binds and unbinds alike.
    pub fn make_current_calls(&self) -> usize {
        self.state.lock().make_current_calls
    }

    /// Number of live driver contexts.
    pub fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    /// Number of live pbuffers.
    pub fn live_pbuffers(&self) -> usize {
        self.state.lock().pbuffers.len()
    }

    /// Get the context the driver considers bound on the calling thread.
    pub fn current_context(&self) -> Option<DriverContext> {
        self.state.lock().current.get(&thread::current().id()).copied()
    }

    /// Whether `ctx` was created from an attribute list requesting 3.0+.
    pub fn is_core_context(&self, ctx: DriverContext) -> bool {
        self.state.lock().contexts.get(&ctx).is_some_and(|c| c.core)
    }

    /// Get the contexts `ctx` shares object namespaces with.
    pub fn shared_with(&self, ctx: DriverContext) -> Vec<DriverContext> {
        self.state
            .lock()
            .contexts
            .get(&ctx)
            .map(|c| c.shares.clone())
            .unwrap_or_default()
    }

    /// Get the last `copy_context` applied to `ctx` as `(source, mask)`.
    pub fn copied_from(&self, ctx: DriverContext) -> Option<(DriverContext, u32)> {
        self.state.lock().contexts.get(&ctx).and_then(|c| c.copied_from)
    }

    /// Emit a debug message on `ctx`, as a rendering call would.
    ///
    /// Returns `false` if the context has no sink installed.
    pub fn emit_debug_message(&self, ctx: DriverContext, message: &DebugMessage<'_>) -> bool {
        let sink = self
            .state
            .lock()
            .contexts
            .get(&ctx)
            .and_then(|c| c.debug_sink.clone());
        match sink {
            Some(sink) => {
                sink(message);
                true
            }
            None => false,
        }
    }

    fn map_range(buffer: &DummyBuffer, request: &MapRequest) -> Result<(usize, usize), DriverError> {
        if buffer.mapping.is_some() {
            return Err(DriverError::Failed("buffer already mapped".into()));
        }
        let length = request
            .length
            .unwrap_or_else(|| buffer.data.len().saturating_sub(request.offset));
        match request.offset.checked_add(length) {
            Some(end) if end <= buffer.data.len() => Ok((request.offset, length)),
            _ => Err(DriverError::Failed(format!(
                "range {}+{} exceeds buffer of {} bytes",
                request.offset,
                length,
                buffer.data.len()
            ))),
        }
    }
}

impl Default for DummyDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DummyDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DummyDriver")
            .field("contexts", &state.contexts.len())
            .field("pbuffers", &state.pbuffers.len())
            .field("buffers", &state.buffers.len())
            .field("unrepresentable", &self.unrepresentable)
            .finish_non_exhaustive()
    }
}

impl Driver for DummyDriver {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn create_context(&self, dc: DeviceContext) -> Result<DriverContext, DriverError> {
        let mut state = self.state.lock();
        let ctx = DriverContext(state.next_id());
        log::trace!("DummyDriver: creating context {:?} on {:?}", ctx, dc);
        state.contexts.insert(
            ctx,
            DummyContext {
                dc,
                core: false,
                shares: Vec::new(),
                copied_from: None,
                debug_sink: None,
            },
        );
        Ok(ctx)
    }

    fn create_context_attribs(
        &self,
        dc: DeviceContext,
        share: Option<DriverContext>,
        attribs: &[ContextAttrib],
    ) -> Result<DriverContext, DriverError> {
        let mut state = self.state.lock();
        if let Some(share) = share {
            if !state.contexts.contains_key(&share) {
                return Err(DriverError::Failed(format!("unknown share context {share:?}")));
            }
        }
        let ctx = DriverContext(state.next_id());
        log::trace!(
            "DummyDriver: creating context {:?} on {:?} with {} attribs",
            ctx,
            dc,
            attribs.len()
        );
        state.contexts.insert(
            ctx,
            DummyContext {
                dc,
                core: ContextAttrib::requests_v3(attribs),
                shares: share.into_iter().collect(),
                copied_from: None,
                debug_sink: None,
            },
        );
        if let Some(share) = share {
            if let Some(shared) = state.contexts.get_mut(&share) {
                shared.shares.push(ctx);
            }
        }
        Ok(ctx)
    }

    fn delete_context(&self, ctx: DriverContext) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_next_delete.take() {
            return Err(error);
        }
        let Some(deleted) = state.contexts.remove(&ctx) else {
            return Err(DriverError::Failed(format!("unknown context {ctx:?}")));
        };
        log::trace!("DummyDriver: deleting context {:?} on {:?}", ctx, deleted.dc);
        state.current.retain(|_, bound| *bound != ctx);
        state.buffers.retain(|(owner, _), _| *owner != Some(ctx));
        for other in state.contexts.values_mut() {
            other.shares.retain(|shared| *shared != ctx);
        }
        Ok(())
    }

    fn make_current(
        &self,
        _draw: Option<DeviceContext>,
        _read: Option<DeviceContext>,
        ctx: Option<DriverContext>,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.make_current_calls += 1;
        let me = thread::current().id();
        let Some(ctx) = ctx else {
            state.current.remove(&me);
            return Ok(());
        };
        if let Some(error) = state.fail_next_make_current.take() {
            return Err(error);
        }
        if !state.contexts.contains_key(&ctx) {
            return Err(DriverError::Failed(format!("unknown context {ctx:?}")));
        }
        if state
            .current
            .iter()
            .any(|(thread, bound)| *bound == ctx && *thread != me)
        {
            return Err(DriverError::Failed(format!(
                "context {ctx:?} is bound on another thread"
            )));
        }
        state.current.insert(me, ctx);
        Ok(())
    }

    fn copy_context(
        &self,
        src: DriverContext,
        dst: DriverContext,
        mask: u32,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if !state.contexts.contains_key(&src) {
            return Err(DriverError::Failed(format!("unknown context {src:?}")));
        }
        let Some(target) = state.contexts.get_mut(&dst) else {
            return Err(DriverError::Failed(format!("unknown context {dst:?}")));
        };
        target.copied_from = Some((src, mask));
        Ok(())
    }

    fn share_lists(&self, src: DriverContext, dst: DriverContext) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if !state.contexts.contains_key(&src) || !state.contexts.contains_key(&dst) {
            return Err(DriverError::Failed("unknown context".into()));
        }
        for (a, b) in [(src, dst), (dst, src)] {
            if let Some(context) = state.contexts.get_mut(&a) {
                if !context.shares.contains(&b) {
                    context.shares.push(b);
                }
            }
        }
        Ok(())
    }

    fn create_pbuffer(
        &self,
        dc: DeviceContext,
        _format: i32,
        width: i32,
        height: i32,
    ) -> Result<DriverPbuffer, DriverError> {
        if width <= 0 || height <= 0 {
            return Err(DriverError::Failed(format!("invalid pbuffer size {width}x{height}")));
        }
        let mut state = self.state.lock();
        let pbuffer = DriverPbuffer(state.next_id());
        log::trace!(
            "DummyDriver: creating pbuffer {:?} on {:?} ({}x{})",
            pbuffer,
            dc,
            width,
            height
        );
        state.pbuffers.insert(
            pbuffer,
            DummyPbuffer {
                width,
                height,
                dc_acquired: false,
            },
        );
        Ok(pbuffer)
    }

    fn destroy_pbuffer(&self, pbuffer: DriverPbuffer) -> Result<(), DriverError> {
        log::trace!("DummyDriver: destroying pbuffer {:?}", pbuffer);
        self.state
            .lock()
            .pbuffers
            .remove(&pbuffer)
            .map(|_| ())
            .ok_or_else(|| DriverError::Failed(format!("unknown pbuffer {pbuffer:?}")))
    }

    fn pbuffer_dc(&self, pbuffer: DriverPbuffer) -> Result<DeviceContext, DriverError> {
        let mut state = self.state.lock();
        let Some(entry) = state.pbuffers.get_mut(&pbuffer) else {
            return Err(DriverError::Failed(format!("unknown pbuffer {pbuffer:?}")));
        };
        entry.dc_acquired = true;
        Ok(DeviceContext(PBUFFER_DC_BASE | pbuffer.0))
    }

    fn release_pbuffer_dc(
        &self,
        pbuffer: DriverPbuffer,
        dc: DeviceContext,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        match state.pbuffers.get_mut(&pbuffer) {
            Some(entry) if entry.dc_acquired && dc == DeviceContext(PBUFFER_DC_BASE | pbuffer.0) => {
                entry.dc_acquired = false;
                Ok(())
            }
            Some(_) => Err(DriverError::Failed(format!(
                "{dc:?} was not acquired from {pbuffer:?}"
            ))),
            None => Err(DriverError::Failed(format!("unknown pbuffer {pbuffer:?}"))),
        }
    }

    fn query_pbuffer(
        &self,
        pbuffer: DriverPbuffer,
        attrib: PbufferAttribute,
    ) -> Result<i32, DriverError> {
        let state = self.state.lock();
        let Some(entry) = state.pbuffers.get(&pbuffer) else {
            return Err(DriverError::Failed(format!("unknown pbuffer {pbuffer:?}")));
        };
        Ok(match attrib {
            PbufferAttribute::Width => entry.width,
            PbufferAttribute::Height => entry.height,
            PbufferAttribute::Lost => 0,
        })
    }

    fn map_buffer(&self, request: &MapRequest, transfer: MapTransfer<'_>) -> MapOutcome {
        let mut state = self.state.lock();
        if let Err(error) = state.require_current() {
            return MapOutcome::Failed(error);
        }
        let slot = state.buffer_slot(request.key);
        let Some(buffer) = state.buffers.get_mut(&slot) else {
            return MapOutcome::Failed(DriverError::Failed(format!(
                "unknown buffer {:?}",
                request.key
            )));
        };

        match transfer {
            MapTransfer::Direct => {
                let (offset, length) = match Self::map_range(buffer, request) {
                    Ok(range) => range,
                    Err(error) => return MapOutcome::Failed(error),
                };
                let caller_ptr = if self.unrepresentable {
                    None
                } else {
                    MappedPtr::from_raw(buffer.data[offset..].as_mut_ptr())
                };
                buffer.mapping = Some(DummyMapping {
                    offset,
                    length,
                    access: request.access,
                    caller_ptr,
                    copied: false,
                });
                match caller_ptr {
                    Some(ptr) => MapOutcome::Mapped(ptr),
                    None => MapOutcome::Unrepresentable { required: length },
                }
            }
            MapTransfer::CopyInto(region) => {
                let Some(mapping) = buffer.mapping.as_mut().filter(|m| m.caller_ptr.is_none())
                else {
                    return MapOutcome::Failed(DriverError::Failed(
                        "copy retry without a pending mapping".into(),
                    ));
                };
                if region.len() < mapping.length {
                    return MapOutcome::Failed(DriverError::Failed(format!(
                        "copy region of {} bytes is smaller than the {}-byte mapping",
                        region.len(),
                        mapping.length
                    )));
                }
                if !mapping.access.discards_contents() {
                    let range = mapping.offset..mapping.offset + mapping.length;
                    region[..mapping.length].copy_from_slice(&buffer.data[range]);
                }
                let ptr = MappedPtr::from_slice(region);
                mapping.caller_ptr = Some(ptr);
                mapping.copied = true;
                MapOutcome::Mapped(ptr)
            }
        }
    }

    fn unmap_buffer(&self, key: BufferKey, transfer: UnmapTransfer<'_>) -> UnmapOutcome {
        let mut state = self.state.lock();
        let slot = state.buffer_slot(key);
        let Some(buffer) = state.buffers.get_mut(&slot) else {
            return UnmapOutcome::Failed(DriverError::Failed(format!("unknown buffer {key:?}")));
        };
        let Some(mapping) = buffer.mapping.take() else {
            return UnmapOutcome::Failed(DriverError::Failed(format!("{key:?} is not mapped")));
        };

        match transfer {
            UnmapTransfer::Direct if mapping.copied => {
                buffer.mapping = Some(mapping);
                UnmapOutcome::Unrepresentable
            }
            UnmapTransfer::Direct => UnmapOutcome::Unmapped,
            UnmapTransfer::CopyBack(region) => {
                if mapping.access.contains(MapAccess::WRITE) {
                    let Some(source) = region.get(..mapping.length) else {
                        buffer.mapping = Some(mapping);
                        return UnmapOutcome::Failed(DriverError::Failed(
                            "copy-back region is shorter than the mapping".into(),
                        ));
                    };
                    let range = mapping.offset..mapping.offset + mapping.length;
                    buffer.data[range].copy_from_slice(source);
                }
                UnmapOutcome::Unmapped
            }
        }
    }

    fn mapped_pointer(&self, key: BufferKey) -> Option<MappedPtr> {
        let state = self.state.lock();
        state
            .buffers
            .get(&state.buffer_slot(key))
            .and_then(|b| b.mapping.as_ref())
            .and_then(|m| m.caller_ptr)
    }

    fn buffer_size(&self, key: BufferKey) -> Result<usize, DriverError> {
        let state = self.state.lock();
        state
            .buffers
            .get(&state.buffer_slot(key))
            .map(|b| b.data.len())
            .ok_or_else(|| DriverError::Failed(format!("unknown buffer {key:?}")))
    }

    fn set_debug_sink(&self, ctx: DriverContext, sink: Option<DebugSink>) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let Some(context) = state.contexts.get_mut(&ctx) else {
            return Err(DriverError::Failed(format!("unknown context {ctx:?}")));
        };
        context.debug_sink = sink;
        Ok(())
    }

    fn extensions(&self) -> Vec<String> {
        self.extensions.clone()
    }
}
