//! Pairs entry and exit notifications into [`HeapEvent`]s and fans them out
//! to the registries, the event log and the log sink.
//!
//! Every `on_*` method may be called from any thread of the target at any
//! time. Each one takes the locks it needs one at a time, never nested.
//!
//! Per `(thread, kind)` a call goes `Idle -> Staged` on entry and back to
//! `Idle` on exit. A second entry before the exit just overwrites the staged
//! size. Frees have no entry half: the address and caller arrive together.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    config::TraceOptions,
    error::{Result, TraceError},
    event::{render, unix_now, EventLog, HeapEvent, OperationKind, RenderOptions},
    fault::ExceptionRecord,
    host::Host,
    registry::{ChunkRegistry, ModuleImage, ModuleRegistry, PendingCallStore},
    resolve::AddressResolver,
    sink::{BufferedLogSink, Destination},
    Address, ThreadId,
};

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "YES"
    } else {
        "NO"
    }
}

pub struct HeapTracer<H> {
    options: TraceOptions,
    render_options: RenderOptions,
    host: H,
    modules: ModuleRegistry,
    chunks: ChunkRegistry,
    pending: PendingCallStore,
    events: EventLog,
    sink: BufferedLogSink,
    started_at: u64,
    /// Set once the footer has been written; nothing is traced after that
    closed: AtomicBool,
}

impl<H> HeapTracer<H>
where
    H: Host,
{
    pub fn new(options: TraceOptions, host: H, sink: BufferedLogSink) -> Self {
        let render_options = RenderOptions {
            pid: host.pid(),
            show_timestamps: options.show_timestamps,
            silent: options.silent,
        };
        Self {
            options,
            render_options,
            host,
            modules: ModuleRegistry::new(),
            chunks: ChunkRegistry::new(),
            pending: PendingCallStore::new(),
            events: EventLog::new(),
            sink,
            started_at: unix_now(),
            closed: AtomicBool::new(false),
        }
    }

    /// Create the log files named by `options` and write the run header
    pub fn open(options: TraceOptions, host: H) -> Result<Self> {
        let pid = host.pid();
        let sink = BufferedLogSink::to_files(
            options.primary_log_path(pid),
            options.exception_log_path(pid),
            options.buffer_output,
        )?;
        log::debug!(
            "tracing pid {pid} into {}",
            options.primary_log_path(pid).display()
        );
        let tracer = Self::new(options, host, sink);
        tracer.start()?;
        Ok(tracer)
    }

    /// Write the run header to the primary log
    pub fn start(&self) -> Result<()> {
        let options = &self.options;
        let header = [
            "Instrumentation started".to_owned(),
            format!("Session start: {}", self.started_at),
            format!("PID: {}", self.render_options.pid),
            format!("Logging heap alloc: {}", yes_no(options.log_allocations)),
            format!("Logging heap free: {}", yes_no(options.log_frees)),
            format!("Timestamps: {}", yes_no(options.show_timestamps)),
            format!("Silent: {}", yes_no(options.silent)),
            format!("Buffered output: {}", yes_no(options.buffer_output)),
            "==========================================\n".to_owned(),
        ];
        self.emit(Destination::Primary, header.join("\n"))
    }

    pub fn options(&self) -> &TraceOptions {
        &self.options
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn chunks(&self) -> &ChunkRegistry {
        &self.chunks
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn sink(&self) -> &BufferedLogSink {
        &self.sink
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn resolver(&self) -> AddressResolver<'_> {
        AddressResolver::new(&self.modules, &self.events)
    }

    pub fn describe(&self, address: Address) -> String {
        self.resolver().describe(address)
    }

    /// Write to the sink, treating a sink closed under our feet by a
    /// concurrent shutdown as a dropped line rather than an error
    fn emit(&self, destination: Destination, text: String) -> Result<()> {
        match self.sink.write(destination, text) {
            Err(TraceError::Closed(_)) if self.is_closed() => {
                log::trace!("dropped a {destination} line written during shutdown");
                Ok(())
            }
            other => other,
        }
    }

    fn caller_module(&self, caller: Address) -> String {
        self.modules
            .find_owner(caller)
            .map(|image| image.name)
            .or_else(|| self.host.module_name_at(caller))
            .unwrap_or_default()
    }

    /// Append `event` to the event log, then emit its line. The event log
    /// and the chunk registry are already updated when the sink fails.
    fn record(&self, event: HeapEvent) -> Result<HeapEvent> {
        self.events.push(event.clone());
        if let Some(line) = render(&event, &self.render_options) {
            self.emit(Destination::Primary, line)?;
        }
        Ok(event)
    }

    pub fn on_image_loaded(&self, name: &str, base: Address, end: Address) -> Result<ModuleImage> {
        let image = self.modules.record_image_load(name, base, end);
        log::debug!("image {name} at {base:#x}..{end:#x}");
        if !self.is_closed() {
            self.emit(
                Destination::Primary,
                format!("** Module {name} loaded at {base:#x} **"),
            )?;
        }
        Ok(image)
    }

    /// The host attached one of its hooks to `function` at `address`
    pub fn on_hook_installed(&self, function: &str, address: Address) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.emit(
            Destination::Primary,
            format!("Adding instrumentation for {function} ({address:#x})"),
        )
    }

    fn traces(&self, kind: OperationKind) -> bool {
        if self.is_closed() {
            return false;
        }
        match kind {
            OperationKind::Free => self.options.log_frees,
            _ => self.options.log_allocations,
        }
    }

    pub fn on_call_entry(&self, thread: ThreadId, kind: OperationKind, requested_size: u64) {
        if kind == OperationKind::Free {
            log::warn!("ignoring entry notification for free on thread {thread}");
            return;
        }
        if self.traces(kind) {
            self.pending.stage(thread, kind, requested_size);
        }
    }

    /// Complete the call staged by the last `on_call_entry` for `(thread,
    /// kind)`. Returns the recorded event, or `None` if the result was
    /// filtered out.
    pub fn on_call_exit(
        &self,
        thread: ThreadId,
        kind: OperationKind,
        result: Address,
        caller: Address,
    ) -> Result<Option<HeapEvent>> {
        if kind == OperationKind::Free {
            log::warn!("ignoring exit notification for free on thread {thread}");
            return Ok(None);
        }
        if !self.traces(kind) {
            return Ok(None);
        }
        let staged = self.pending.take(thread, kind);
        if kind.is_noise_filtered() && !self.options.noise_band.admits(result) {
            log::trace!("{kind} on thread {thread} returned {result:#x}, not a chunk");
            return Ok(None);
        }
        if staged.stale {
            log::debug!(
                "{kind} exit on thread {thread} had no fresh entry, reusing size {:#x}",
                staged.size
            );
        }
        let event = HeapEvent::new(
            kind,
            result,
            staged.size,
            caller,
            self.caller_module(caller),
            unix_now(),
        );
        self.chunks.upsert(result, staged.size);
        self.record(event).map(Some)
    }

    /// Record a free of `address`. Its size is whatever the chunk registry
    /// still knew, 0 for untracked addresses.
    pub fn on_free(&self, address: Address, caller: Address) -> Result<Option<HeapEvent>> {
        if !self.traces(OperationKind::Free) {
            return Ok(None);
        }
        if !self.options.noise_band.admits(address) {
            log::trace!("free of {address:#x} is not a chunk");
            return Ok(None);
        }
        let size = self.chunks.remove(address).unwrap_or(0);
        let event = HeapEvent::new(
            OperationKind::Free,
            address,
            size,
            caller,
            self.caller_module(caller),
            unix_now(),
        );
        self.record(event).map(Some)
    }

    /// Log a fatal exception and kill the target. Returns whether the code
    /// was fatal; other codes are left for the target to handle.
    pub fn on_exception(&self, record: &ExceptionRecord) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        if !self.options.fatal_codes.contains(record.fault_code) {
            log::debug!(
                "exception {:#x} on thread {} is not fatal",
                record.fault_code,
                record.thread_id
            );
            return Ok(false);
        }
        log::error!(
            "fatal exception {:#x} at {:#x} on thread {}",
            record.fault_code,
            record.fault_address,
            record.thread_id
        );
        let block = record.render(self.render_options.pid, unix_now(), &self.resolver());
        let logged = self
            .emit(Destination::Exception, block)
            .and(self.close_out().map(|_| ()));
        if let Err(e) = &logged {
            log::error!("exception report incomplete: {e}");
        }
        self.host.terminate(record.fault_code as i32);
        logged.map(|()| true)
    }

    pub fn on_thread_start(&self, thread: ThreadId) {
        log::trace!("thread {thread} started");
    }

    pub fn on_thread_stop(&self, thread: ThreadId) {
        log::trace!("thread {thread} stopped");
        self.pending.forget_thread(thread);
    }

    /// The target is spawning `child`. Always returns `true`: follow it.
    pub fn on_child_process(&self, child: u32) -> Result<bool> {
        log::debug!("following child process {child}");
        if !self.is_closed() {
            self.emit(
                Destination::Primary,
                format!(
                    "\n*******************************\n\
                     Creating child process from parent PID {}\n\
                     *******************************\n",
                    self.render_options.pid
                ),
            )?;
        }
        Ok(true)
    }

    /// Normal end of the target: write the footer and close both logs.
    /// Later calls (and calls after a fatal exception) do nothing.
    pub fn finish(&self) -> Result<()> {
        self.close_out().map(|_| ())
    }

    fn close_out(&self) -> Result<bool> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let total = self.events.len();
        // every step runs even if an earlier one failed; the first error wins
        let footer = self.sink.write(
            Destination::Primary,
            format!("\n\nNumber of heap operations logged: {total}\n# EOF"),
        );
        let dump = match &self.options.event_dump {
            Some(path) => self.events.write_json(path),
            None => Ok(()),
        };
        let primary = self.sink.close(Destination::Primary);
        let exception = self.sink.close(Destination::Exception);
        footer.and(dump).and(primary).and(exception)?;
        log::debug!("trace closed after {total} heap operations");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::sink::tests::{Broken, SharedBuf};

    #[derive(Default)]
    struct FakeHost {
        terminated: Mutex<Vec<i32>>,
    }

    impl Host for FakeHost {
        fn pid(&self) -> u32 {
            1234
        }

        fn module_name_at(&self, address: Address) -> Option<String> {
            (0x7700_0000..0x7800_0000)
                .contains(&address)
                .then(|| "host-known.dll".to_owned())
        }

        fn terminate(&self, exit_code: i32) {
            self.terminated.lock().unwrap().push(exit_code);
        }
    }

    struct Rig {
        tracer: HeapTracer<FakeHost>,
        primary: SharedBuf,
        exception: SharedBuf,
    }

    fn rig(options: TraceOptions) -> Rig {
        let primary = SharedBuf::default();
        let exception = SharedBuf::default();
        let sink = BufferedLogSink::new(
            Box::new(primary.clone()),
            Box::new(exception.clone()),
            options.buffer_output,
        );
        Rig {
            tracer: HeapTracer::new(options, FakeHost::default(), sink),
            primary,
            exception,
        }
    }

    fn unbuffered() -> TraceOptions {
        TraceOptions {
            buffer_output: false,
            ..TraceOptions::default()
        }
    }

    #[test]
    fn alloc_then_free_round_trip() {
        let Rig {
            tracer, primary, ..
        } = rig(unbuffered());
        tracer.on_image_loaded("target.exe", 0x40_0000, 0x40_8000).unwrap();

        tracer.on_call_entry(1, OperationKind::Allocate, 0x20);
        let event = tracer
            .on_call_exit(1, OperationKind::Allocate, 0x0040_1000, 0x0040_2000)
            .unwrap()
            .unwrap();
        assert_eq!(event.caller_module, "target.exe");
        assert_eq!(tracer.chunks().lookup(0x40_1000), Some(0x20));
        assert_eq!(tracer.describe(0x40_9010), "");

        let freed = tracer.on_free(0x0040_1000, 0x0040_2000).unwrap().unwrap();
        assert_eq!(freed.size, 0x20);
        assert_eq!(tracer.chunks().lookup(0x40_1000), None);

        let lines = primary.lines();
        assert_eq!(
            lines[lines.len() - 2],
            "PID: 1234 | alloc(0x20) = 0x401000 from 0x402000 (target.exe)"
        );
        assert_eq!(
            lines[lines.len() - 1],
            "PID: 1234 | free(0x401000) from 0x402000 (size was 0x20) (target.exe)"
        );
    }

    #[test]
    fn noise_is_dropped_except_for_virtualalloc() {
        let Rig {
            tracer, primary, ..
        } = rig(unbuffered());
        tracer.on_call_entry(1, OperationKind::Allocate, 0x10);
        assert_eq!(
            tracer.on_call_exit(1, OperationKind::Allocate, 0x800, 0x40_2000).unwrap(),
            None
        );
        assert_eq!(tracer.on_free(0x10, 0x40_2000).unwrap(), None);

        tracer.on_call_entry(1, OperationKind::VirtualAlloc, 0x1000);
        let event = tracer
            .on_call_exit(1, OperationKind::VirtualAlloc, 0x800, 0x40_2000)
            .unwrap()
            .unwrap();
        assert_eq!(event.chunk_end, 0x1800);
        assert_eq!(tracer.chunks().lookup(0x800), Some(0x1000));

        // a failed page allocation still shows up, size and caller included
        tracer.on_call_entry(1, OperationKind::VirtualAlloc, 0x2000);
        let failed = tracer
            .on_call_exit(1, OperationKind::VirtualAlloc, 0, 0x40_2000)
            .unwrap()
            .unwrap();
        assert_eq!((failed.chunk_start, failed.size), (0, 0x2000));
        assert_eq!(tracer.events().len(), 2);
        assert_eq!(tracer.describe(0), "");
        assert!(primary
            .text()
            .ends_with("virtualalloc(0x2000) at 0x0 from 0x402000 ()\n"));
    }

    #[test]
    fn host_lookup_backs_up_the_module_registry() {
        let Rig { tracer, .. } = rig(unbuffered());
        tracer.on_call_entry(2, OperationKind::Reallocate, 0x40);
        let event = tracer
            .on_call_exit(2, OperationKind::Reallocate, 0x50_0000, 0x7700_1234)
            .unwrap()
            .unwrap();
        assert_eq!(event.caller_module, "host-known.dll");

        let event = tracer.on_free(0x50_0000, 0x1234_5678).unwrap().unwrap();
        assert_eq!(event.caller_module, "");
    }

    #[test]
    fn missed_entry_reuses_stale_size() {
        let Rig { tracer, .. } = rig(unbuffered());
        tracer.on_call_entry(1, OperationKind::Allocate, 0x18);
        tracer.on_call_exit(1, OperationKind::Allocate, 0x50_0000, 0x40_2000).unwrap();
        let event = tracer
            .on_call_exit(1, OperationKind::Allocate, 0x50_1000, 0x40_2000)
            .unwrap()
            .unwrap();
        assert_eq!(event.size, 0x18);
    }

    #[test]
    fn silent_mode_keeps_tracking() {
        let run = |silent: bool| {
            let rig = rig(TraceOptions {
                silent,
                ..unbuffered()
            });
            for (tid, address, size) in [(1, 0x50_0000, 0x10), (2, 0x50_1000, 0x20)] {
                rig.tracer.on_call_entry(tid, OperationKind::Allocate, size);
                rig.tracer
                    .on_call_exit(tid, OperationKind::Allocate, address, 0x40_2000)
                    .unwrap();
            }
            rig.tracer.on_free(0x50_0000, 0x40_2000).unwrap();
            let body = rig
                .primary
                .lines()
                .into_iter()
                .filter(|line| line.starts_with("PID: 1234 |"))
                .count();
            (rig.tracer.chunks().snapshot(), rig.tracer.events().len(), body)
        };
        let (loud_chunks, loud_events, loud_lines) = run(false);
        let (quiet_chunks, quiet_events, quiet_lines) = run(true);
        assert_eq!(loud_chunks, quiet_chunks);
        assert_eq!(loud_events, quiet_events);
        assert_eq!(loud_lines, 3);
        assert_eq!(quiet_lines, 0);
    }

    #[test]
    fn disabled_kinds_are_not_traced() {
        let Rig { tracer, .. } = rig(TraceOptions {
            log_allocations: false,
            log_frees: false,
            ..unbuffered()
        });
        tracer.on_call_entry(1, OperationKind::Allocate, 0x20);
        assert_eq!(
            tracer.on_call_exit(1, OperationKind::Allocate, 0x50_0000, 0x40_2000).unwrap(),
            None
        );
        assert_eq!(tracer.on_free(0x50_0000, 0x40_2000).unwrap(), None);
        assert!(tracer.chunks().is_empty());
        assert!(tracer.events().is_empty());
    }

    #[test]
    fn fatal_exception_closes_logs_and_terminates() {
        let Rig {
            tracer,
            primary,
            exception,
        } = rig(TraceOptions::default());
        tracer.on_call_entry(1, OperationKind::Allocate, 0x20);
        tracer.on_call_exit(1, OperationKind::Allocate, 0x50_0000, 0x40_2000).unwrap();

        let benign = ExceptionRecord {
            thread_id: 1,
            fault_address: 0x50_0000,
            fault_code: 0x8000_0003,
            registers: Vec::new(),
        };
        assert!(!tracer.on_exception(&benign).unwrap());
        assert!(exception.text().is_empty());

        let fatal = ExceptionRecord {
            fault_code: 0xC000_0005,
            registers: vec![("EAX".to_owned(), 0x50_0008)],
            ..benign
        };
        assert!(tracer.on_exception(&fatal).unwrap());
        assert_eq!(*tracer.host().terminated.lock().unwrap(), [0xC000_0005u32 as i32]);
        assert!(tracer.is_closed());
        assert!(!tracer.sink().is_open(Destination::Primary));
        assert!(!tracer.sink().is_open(Destination::Exception));

        let report = exception.text();
        assert!(report.contains("Exception 0xc0000005 in thread 1 at 0x500000 alloc(size=0x20)"));
        assert!(report.contains("EAX: 0x00500008 alloc(size=0x20)"));
        assert!(primary.text().ends_with("Number of heap operations logged: 1\n# EOF\n"));

        // terminal: nothing afterwards is traced or reported
        tracer.on_call_entry(1, OperationKind::Allocate, 0x20);
        assert_eq!(
            tracer.on_call_exit(1, OperationKind::Allocate, 0x60_0000, 0x40_2000).unwrap(),
            None
        );
        assert!(!tracer.on_exception(&fatal).unwrap());
        tracer.finish().unwrap();
        assert_eq!(tracer.host().terminated.lock().unwrap().len(), 1);
    }

    #[test]
    fn failed_writes_leave_registry_and_event_log_in_step() {
        let tracer = HeapTracer::new(
            unbuffered(),
            FakeHost::default(),
            BufferedLogSink::new(Box::new(Broken), Box::new(SharedBuf::default()), false),
        );
        tracer.on_call_entry(1, OperationKind::Allocate, 0x20);
        assert!(matches!(
            tracer.on_call_exit(1, OperationKind::Allocate, 0x50_0000, 0x40_2000),
            Err(TraceError::Write {
                destination: Destination::Primary,
                ..
            })
        ));
        assert_eq!(tracer.chunks().snapshot(), [(0x50_0000, 0x20)]);
        assert_eq!(tracer.events().len(), 1);
        assert_eq!(tracer.describe(0x50_0010), "alloc(size=0x20)");

        assert!(tracer.on_free(0x50_0000, 0x40_2000).is_err());
        assert!(tracer.chunks().is_empty());
        let kinds: Vec<_> = tracer.events().snapshot().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, [OperationKind::Allocate, OperationKind::Free]);
    }

    #[test]
    fn fatal_exception_terminates_even_if_the_report_fails() {
        let primary = SharedBuf::default();
        let tracer = HeapTracer::new(
            TraceOptions::default(),
            FakeHost::default(),
            BufferedLogSink::new(Box::new(primary.clone()), Box::new(Broken), true),
        );
        let fatal = ExceptionRecord {
            thread_id: 2,
            fault_address: 0x50_0000,
            fault_code: 0xC000_0005,
            registers: Vec::new(),
        };
        assert!(matches!(
            tracer.on_exception(&fatal),
            Err(TraceError::Write {
                destination: Destination::Exception,
                ..
            })
        ));
        assert_eq!(*tracer.host().terminated.lock().unwrap(), [0xC000_0005u32 as i32]);
        assert!(tracer.is_closed());
        assert!(!tracer.sink().is_open(Destination::Primary));
        assert!(!tracer.sink().is_open(Destination::Exception));
        assert!(primary.text().ends_with("Number of heap operations logged: 0\n# EOF\n"));
    }

    #[test]
    fn header_footer_and_banners() {
        let Rig {
            tracer, primary, ..
        } = rig(TraceOptions::default());
        tracer.start().unwrap();
        tracer.on_image_loaded("ntdll.dll", 0x7700_0000, 0x7710_0000).unwrap();
        tracer.on_hook_installed("RtlAllocateHeap", 0x7701_0000).unwrap();
        assert!(tracer.on_child_process(99).unwrap());
        tracer.on_free(0x50_0000, 0x7701_0040).unwrap();
        assert!(primary.text().is_empty());
        tracer.finish().unwrap();
        tracer.finish().unwrap();

        let text = primary.text();
        assert!(text.starts_with("Instrumentation started\n"));
        for expected in [
            "PID: 1234\n",
            "Logging heap alloc: YES\n",
            "Logging heap free: YES\n",
            "Buffered output: YES\n",
            "==========================================\n\n",
            "** Module ntdll.dll loaded at 0x77000000 **\n",
            "Adding instrumentation for RtlAllocateHeap (0x77010000)\n",
            "Creating child process from parent PID 1234\n",
            "free(0x500000) from 0x77010040 (size was 0x0) (ntdll.dll)\n",
        ] {
            assert!(text.contains(expected), "missing {expected:?}");
        }
        assert!(text.ends_with("\n\n\nNumber of heap operations logged: 1\n# EOF\n"));
        assert_eq!(text.matches("# EOF").count(), 1);
    }

    #[test]
    fn thread_stop_forgets_staged_sizes() {
        let Rig { tracer, .. } = rig(unbuffered());
        tracer.on_thread_start(5);
        tracer.on_call_entry(5, OperationKind::Allocate, 0x30);
        tracer.on_thread_stop(5);
        let event = tracer
            .on_call_exit(5, OperationKind::Allocate, 0x50_0000, 0x40_2000)
            .unwrap()
            .unwrap();
        assert_eq!(event.size, 0);
    }

    #[test]
    fn threads_trace_concurrently() {
        let Rig {
            tracer, primary, ..
        } = rig(TraceOptions::default());
        crossbeam::scope(|s| {
            for tid in 0..8u32 {
                let tracer = &tracer;
                s.spawn(move |_| {
                    for i in 0..500u64 {
                        let address = 0x1000_0000 + u64::from(tid) * 0x10_0000 + i * 0x100;
                        let size = 0x10 + i;
                        tracer.on_call_entry(tid, OperationKind::Allocate, size);
                        let event = tracer
                            .on_call_exit(tid, OperationKind::Allocate, address, 0x40_2000)
                            .unwrap()
                            .unwrap();
                        assert_eq!(event.size, size);
                        if i % 2 == 1 {
                            let freed = tracer.on_free(address, 0x40_2000).unwrap().unwrap();
                            assert_eq!(freed.size, size);
                        }
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(tracer.chunks().len(), 8 * 250);
        assert_eq!(tracer.events().len(), 8 * 750);
        tracer.finish().unwrap();
        assert!(primary
            .text()
            .ends_with("Number of heap operations logged: 6000\n# EOF\n"));
    }
}
