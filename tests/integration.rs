//! End-to-end exercises of the dispatcher, the unwinder and the machine
//! facade working together.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::Result;

use aufwind::unwind::arm64::Arm64RuntimeFunction;
use aufwind::unwind::x64::virtual_unwind;
use aufwind::unwind::UnwindFlags;
use aufwind::{
    Arch, Context, DebuggerPort, DebuggerVerdict, DispatcherContext, Disposition, ExceptionCode,
    ExceptionFlags, ExceptionRecord, Fault, FrameHandler, HandlerOutcome, Machine, Resumption,
    RuntimeFunction, VectoredDisposition,
};

const BASE: u64 = 0x40_0000;
const STACK_LIMIT: u64 = 0x7000;
const STACK_BASE: u64 = 0x8000;

fn frame_handler<F>(f: F) -> Rc<dyn FrameHandler>
where
    F: Fn(&ExceptionRecord, u64, &mut Context, &mut DispatcherContext) -> HandlerOutcome + 'static,
{
    Rc::new(f)
}

fn vectored<F>(f: F) -> Rc<dyn Fn(&ExceptionRecord, &mut Context) -> VectoredDisposition>
where
    F: Fn(&ExceptionRecord, &mut Context) -> VectoredDisposition + 'static,
{
    Rc::new(f)
}

/// UNWIND_INFO slot: prologue offset, opcode, opcode info.
fn slot(offset: u8, op: u8, info: u8) -> u16 {
    offset as u16 | ((op as u16) << 8) | ((info as u16) << 12)
}

fn unwind_info_bytes(flags: u8, prolog: u8, slots: &[u16], handler_rva: Option<u32>) -> Vec<u8> {
    let mut bytes = vec![1 | (flags << 3), prolog, slots.len() as u8, 0];
    for s in slots {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    if slots.len() % 2 == 1 {
        bytes.extend_from_slice(&[0, 0]);
    }
    if let Some(rva) = handler_rva {
        bytes.extend_from_slice(&rva.to_le_bytes());
    }
    bytes
}

fn machine_with_thread(arch: Arch) -> (Machine, aufwind::ThreadId) {
    let mut machine = Machine::new(arch);
    machine.memory.map(BASE, 0x4000);
    machine.memory.map(STACK_LIMIT, (STACK_BASE - STACK_LIMIT) as usize);
    let thread = machine.create_thread(STACK_LIMIT, STACK_BASE);
    (machine, thread)
}

#[test]
fn virtual_unwind_replays_the_expected_prefix_at_every_prologue_offset() -> Result<()> {
    // prologue: push rbp; push rbx; sub rsp, 0x40
    let info = unwind_info_bytes(
        0x1, // exception handler present
        8,
        &[slot(8, 2, 7), slot(4, 0, 3), slot(2, 0, 5)],
        Some(0x3000),
    );
    let (mut machine, _) = machine_with_thread(Arch::X64);
    machine.memory.write_bytes(BASE + 0x2000, &info)?;
    let func = RuntimeFunction {
        begin_address: 0x1000,
        end_address: 0x1100,
        unwind_info: 0x2000,
    };
    let ret = BASE + 0x900;
    machine.memory.write_u64(0x7f40, 0xb8)?; // saved rbx
    machine.memory.write_u64(0x7f48, 0xb9)?; // saved rbp
    machine.memory.write_u64(0x7f50, ret)?; // return address

    // (pc offset, rsp at that point, expected rbx, expected rbp, handler?)
    let rows: &[(u64, u64, Option<u64>, Option<u64>, bool)] = &[
        (0x00, 0x7f50, None, None, false),
        (0x02, 0x7f48, None, Some(0xb9), false),
        (0x04, 0x7f40, Some(0xb8), Some(0xb9), false),
        // offset 8 is the first body instruction, so the handler reappears
        (0x08, 0x7f00, Some(0xb8), Some(0xb9), true),
        (0x20, 0x7f00, Some(0xb8), Some(0xb9), true),
    ];
    for &(offset, rsp, rbx, rbp, handler) in rows {
        let mut context = Context {
            rsp,
            rbx: 0xaaaa,
            rbp: 0xbbbb,
            ..Context::default()
        };
        let unwound = virtual_unwind(
            UnwindFlags::EHANDLER,
            BASE,
            BASE + 0x1000 + offset,
            Some(func),
            &mut context,
            &machine.memory,
            None,
        )?;
        assert_eq!(context.rip, ret, "offset {offset:#x}");
        assert_eq!(context.rsp, 0x7f58, "offset {offset:#x}");
        assert_eq!(context.rbx, rbx.unwrap_or(0xaaaa), "rbx at offset {offset:#x}");
        assert_eq!(context.rbp, rbp.unwrap_or(0xbbbb), "rbp at offset {offset:#x}");
        assert_eq!(
            unwound.handler.is_some(),
            handler,
            "handler presence at offset {offset:#x}"
        );
        if handler {
            assert_eq!(unwound.handler.unwrap().address, BASE + 0x3000);
        }
    }
    Ok(())
}

#[test]
fn debug_registers_stay_private_to_each_thread() -> Result<()> {
    let mut machine = Machine::new(Arch::X64);
    let a = machine.create_thread(STACK_LIMIT, STACK_BASE);
    machine.thread_mut(a)?.context.dr0 = 0x4000;
    machine.thread_mut(a)?.context.dr7 = 0x401;

    let b = machine.create_thread(STACK_LIMIT, STACK_BASE);
    let b_context = machine.thread(b)?.context;
    assert_eq!(b_context.dr0, 0);
    assert_eq!(b_context.dr7, 0);

    machine.thread_mut(b)?.context.dr0 = 0x9000;
    let a_context = machine.thread(a)?.context;
    assert_eq!(a_context.dr0, 0x4000);
    assert_eq!(a_context.dr7, 0x401);
    Ok(())
}

#[test]
fn breakpoint_raises_report_a_backed_up_pc_other_codes_do_not() -> Result<()> {
    for (arch, trap_len) in [(Arch::X64, 1u64), (Arch::Arm64, 4u64)] {
        let (mut machine, thread) = machine_with_thread(arch);
        machine.thread_mut(thread)?.context.rip = 0x5004;

        let seen = Rc::new(Cell::new(0u64));
        let observer = Rc::clone(&seen);
        machine.add_vectored_exception_handler(
            false,
            vectored(move |_, context| {
                observer.set(context.rip);
                VectoredDisposition::ContinueExecution
            }),
        );

        machine.raise_software_exception(thread, ExceptionCode::Breakpoint, &[0])?;
        assert_eq!(seen.get(), 0x5004 - trap_len, "{arch:?} breakpoint");

        machine.thread_mut(thread)?.context.rip = 0x5004;
        machine.raise_software_exception(thread, ExceptionCode::IllegalInstruction, &[])?;
        assert_eq!(seen.get(), 0x5004, "{arch:?} non-breakpoint");
    }
    Ok(())
}

#[test]
fn vectored_context_edits_reach_frame_handlers() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X86);
    machine.add_vectored_exception_handler(
        false,
        vectored(|_, context| {
            context.rax = 0x5e17;
            VectoredDisposition::ContinueSearch
        }),
    );

    let outer_saw = Rc::new(Cell::new(0u64));
    let inner_saw = Rc::new(Cell::new(0u64));
    let outer = Rc::clone(&outer_saw);
    let inner = Rc::clone(&inner_saw);
    machine.thread_mut(thread)?.push_frame(
        0x1f80,
        frame_handler(move |_, _, context, _| {
            outer.set(context.rax);
            HandlerOutcome::Disposition(Disposition::ContinueExecution)
        }),
    );
    machine.thread_mut(thread)?.push_frame(
        0x1f00,
        frame_handler(move |_, _, context, _| {
            inner.set(context.rax);
            HandlerOutcome::Disposition(Disposition::ContinueSearch)
        }),
    );

    let record = ExceptionRecord::new(ExceptionCode::IllegalInstruction, 0x5000);
    let context = machine.thread(thread)?.context;
    let outcome = machine.raise_exception(thread, record, context, true)?;
    assert_eq!(outcome, Resumption::Continue);
    assert_eq!(inner_saw.get(), 0x5e17);
    assert_eq!(outer_saw.get(), 0x5e17);
    assert_eq!(machine.thread(thread)?.context.rax, 0x5e17);
    Ok(())
}

#[test]
fn unwind_leaves_the_chain_exactly_at_the_target_frame() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X86);

    let log = Rc::new(RefCell::new(Vec::new()));
    let register = |machine: &mut Machine, frame: u64, log: &Rc<RefCell<Vec<(u64, ExceptionFlags)>>>| {
        let log = Rc::clone(log);
        machine
            .thread_mut(thread)
            .unwrap()
            .push_frame(
                frame,
                frame_handler(move |record, frame, _, _| {
                    log.borrow_mut().push((frame, record.flags));
                    HandlerOutcome::Disposition(Disposition::ContinueSearch)
                }),
            );
    };
    register(&mut machine, 0x1f80, &log); // outermost, the target
    register(&mut machine, 0x1f40, &log);
    register(&mut machine, 0x1f00, &log); // innermost

    let outcome = machine.unwind_to_target(thread, Some(0x1f80), 0x6000, None, 0x77)?;
    assert_eq!(outcome, Resumption::Continue);

    let log = log.borrow();
    assert_eq!(log.len(), 3, "each handler runs exactly once");
    assert_eq!(log[0].0, 0x1f00);
    assert_eq!(log[1].0, 0x1f40);
    assert!(log[0].1.contains(ExceptionFlags::UNWINDING));
    assert!(!log[0].1.contains(ExceptionFlags::TARGET_UNWIND));
    assert_eq!(log[2].0, 0x1f80);
    assert!(log[2].1.contains(ExceptionFlags::TARGET_UNWIND));

    let thread_state = machine.thread(thread)?;
    assert_eq!(thread_state.exception_list_head(), Some(0x1f80));
    assert_eq!(thread_state.context.rip, 0x6000);
    assert_eq!(thread_state.context.rax, 0x77);
    Ok(())
}

#[test]
fn unwind_past_the_target_frame_is_rejected() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X86);
    machine.thread_mut(thread)?.push_frame(
        0x1f00,
        frame_handler(|_, _, _, _| HandlerOutcome::Disposition(Disposition::ContinueSearch)),
    );
    // 0x1e00 is inner to every registered frame, so it can never be reached
    let err = machine
        .unwind_to_target(thread, Some(0x1e00), 0x6000, None, 0)
        .unwrap_err();
    assert_eq!(err, aufwind::Status::InvalidUnwindTarget);
    Ok(())
}

#[test]
fn capture_then_restore_resumes_at_the_capture_point() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X64);
    {
        let context = &mut machine.thread_mut(thread)?.context;
        context.rip = 0x5000;
        context.rbx = 0x1111; // nonvolatile, must survive the round trip
    }
    let captured = machine.capture_context(thread)?;

    let mut passes = 0;
    loop {
        // two "increments" follow the capture point
        {
            let context = &mut machine.thread_mut(thread)?.context;
            context.r12 += 1;
            context.rip += 3;
            context.r12 += 1;
            context.rip += 3;
        }
        if passes == 0 {
            passes += 1;
            machine.restore_context(thread, &captured, None)?;
            continue;
        }
        break;
    }

    let context = machine.thread(thread)?.context;
    assert_eq!(passes, 1, "restore runs the tail exactly once more");
    assert_eq!(context.r12, 2);
    assert_eq!(context.rip, 0x5006);
    assert_eq!(context.rbx, 0x1111);
    Ok(())
}

#[test]
fn long_jump_records_override_the_restored_context() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X64);
    let buffer = 0x7100;
    let words: [u64; 11] = [
        0, // frame
        0xb0b, // rbx
        0x7e00, // rsp
        0xb0b5, // rbp
        0x51, 0xd1, // rsi, rdi
        0x12, 0x13, 0x14, 0x15, // r12..r15
        BASE + 0x1234, // rip
    ];
    for (i, word) in words.iter().enumerate() {
        machine.memory.write_u64(buffer + 8 * i as u64, *word)?;
    }

    let mut record = ExceptionRecord::new(ExceptionCode::LongJump, 0x5000);
    record.parameters = vec![buffer];
    let captured = machine.capture_context(thread)?;
    machine.restore_context(thread, &captured, Some(&record))?;

    let context = machine.thread(thread)?.context;
    assert_eq!(context.rbx, 0xb0b);
    assert_eq!(context.rsp, 0x7e00);
    assert_eq!(context.rbp, 0xb0b5);
    assert_eq!(context.r15, 0x15);
    assert_eq!(context.rip, BASE + 0x1234);
    Ok(())
}

#[test]
fn consolidate_unwind_resumes_where_the_callback_says() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X86);
    machine.thread_mut(thread)?.push_frame(
        0x1f00,
        frame_handler(|_, _, _, _| HandlerOutcome::Disposition(Disposition::ContinueSearch)),
    );
    machine.register_consolidate_callback(
        7,
        Rc::new(|record: &ExceptionRecord| {
            assert_eq!(record.code, ExceptionCode::UnwindConsolidate);
            0xc0de
        }),
    );

    let mut record = ExceptionRecord::new(ExceptionCode::UnwindConsolidate, 0x5000);
    record.parameters = vec![7];
    machine.unwind_to_target(thread, Some(0x1f00), 0x6000, Some(record), 0x55)?;

    let context = machine.thread(thread)?.context;
    assert_eq!(context.rip, 0xc0de, "callback overrides the target pc");
    assert_eq!(context.rax, 0x55);
    Ok(())
}

#[test]
fn privileged_instruction_fault_resumes_where_the_handler_points() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X86);
    machine.memory.write_bytes(BASE + 0x500, &[0xfb, 0xc3])?; // sti; ret
    machine.thread_mut(thread)?.context.rip = BASE + 0x500;

    let invocations = Rc::new(Cell::new(0));
    let count = Rc::clone(&invocations);
    machine.thread_mut(thread)?.push_frame(
        0x1f00,
        frame_handler(move |record, _, context, _| {
            count.set(count.get() + 1);
            assert_eq!(record.code, ExceptionCode::PrivilegedInstruction);
            assert!(record.parameters.is_empty());
            assert_eq!(record.address, BASE + 0x500);
            assert_eq!(context.rip, BASE + 0x500);
            context.rip += 1; // skip the sti
            HandlerOutcome::Disposition(Disposition::ContinueExecution)
        }),
    );

    let outcome = machine.raise_fault(
        thread,
        Fault::GeneralProtection {
            privileged_instruction: true,
        },
    )?;
    assert_eq!(outcome, Resumption::Continue);
    assert_eq!(invocations.get(), 1, "exactly one exception episode");
    assert_eq!(machine.thread(thread)?.context.rip, BASE + 0x501);
    Ok(())
}

#[test]
fn table_dispatch_finds_the_language_handler_through_unwind_metadata() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X64);
    // body: sub rsp, 0x28 and nothing else
    let info = unwind_info_bytes(0x1, 4, &[slot(4, 2, 4)], Some(0x3000));
    machine.memory.write_bytes(BASE + 0x2000, &info)?;
    let func = RuntimeFunction {
        begin_address: 0x1000,
        end_address: 0x1100,
        unwind_info: 0x2000,
    };
    machine.tables.add_function_table(0x10, &[func], BASE);

    machine.memory.write_u64(0x7f28, BASE + 0x3800)?; // caller pc, untabled
    machine.memory.write_u64(0x7f30, 0)?; // caller's caller: end of walk
    {
        let context = &mut machine.thread_mut(thread)?.context;
        context.rip = BASE + 0x1050;
        context.rsp = 0x7f00;
    }

    let seen_frame = Rc::new(Cell::new(0u64));
    let frame = Rc::clone(&seen_frame);
    machine.register_language_handler(
        BASE + 0x3000,
        frame_handler(move |record, establisher, context, dispatch| {
            assert_eq!(record.code, ExceptionCode::AccessViolation);
            assert_eq!(dispatch.control_pc, BASE + 0x1050);
            assert_eq!(dispatch.image_base, BASE);
            frame.set(establisher);
            context.rax = 0x99;
            HandlerOutcome::Disposition(Disposition::ContinueExecution)
        }),
    );

    let outcome = machine.raise_fault(
        thread,
        Fault::PageFault {
            address: 0xdead,
            access: aufwind::dispatch::AccessKind::Read,
        },
    )?;
    assert_eq!(outcome, Resumption::Continue);
    assert_eq!(seen_frame.get(), 0x7f00, "establisher is the pre-call rsp");
    assert_eq!(machine.thread(thread)?.context.rax, 0x99);
    Ok(())
}

/// aarch64 xdata with one code word and an exception handler.
fn write_arm64_xdata(machine: &mut Machine, rva: u64, code_bytes: [u8; 4], handler_rva: u32) -> Result<()> {
    let header: u32 = 0x20 | (1 << 20) | (1 << 27);
    machine.memory.write_bytes(BASE + rva, &header.to_le_bytes())?;
    machine.memory.write_bytes(BASE + rva + 4, &code_bytes)?;
    machine.memory.write_bytes(BASE + rva + 8, &handler_rva.to_le_bytes())?;
    Ok(())
}

#[test]
fn arm64_table_dispatch_walks_frames_through_xdata() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::Arm64);
    // prologue: stp x29,lr,[sp,#-0x20]!; mov x29,sp; sub sp,sp,#0x30
    write_arm64_xdata(&mut machine, 0x2000, [0x03, 0xe1, 0x83, 0xe4], 0x3000)?;
    let entry = Arm64RuntimeFunction {
        begin_address: 0x1000,
        data: 0x2000,
    };
    machine.tables.add_arm64_function_table(0x11, &[entry], BASE, 0x2000);

    machine.memory.write_u64(0x7ef0, 0x7fc0)?; // saved fp
    machine.memory.write_u64(0x7ef8, 0)?; // saved lr: end of walk
    {
        let context = &mut machine.thread_mut(thread)?.context;
        context.rip = BASE + 0x1000 + 4 * 8;
        context.rsp = 0x7ec0;
        context.rbp = 0x7ef0;
    }

    let seen_frame = Rc::new(Cell::new(0u64));
    let frame = Rc::clone(&seen_frame);
    machine.register_language_handler(
        BASE + 0x3000,
        frame_handler(move |record, establisher, context, dispatch| {
            assert_eq!(record.code, ExceptionCode::AccessViolation);
            assert_eq!(dispatch.control_pc, BASE + 0x1000 + 4 * 8);
            assert_eq!(dispatch.image_base, BASE);
            frame.set(establisher);
            context.rax = 0x44;
            HandlerOutcome::Disposition(Disposition::ContinueExecution)
        }),
    );

    let outcome = machine.raise_fault(
        thread,
        Fault::PageFault {
            address: 0xdead,
            access: aufwind::dispatch::AccessKind::Write,
        },
    )?;
    assert_eq!(outcome, Resumption::Continue);
    assert_eq!(seen_frame.get(), 0x7f10, "establisher is the sp above the frame");
    assert_eq!(machine.thread(thread)?.context.rax, 0x44);
    Ok(())
}

#[test]
fn arm64_unwind_to_target_runs_cleanup_through_xdata() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::Arm64);
    // prologue: stp x29,lr,[sp,#-0x20]! and nothing else
    write_arm64_xdata(&mut machine, 0x2000, [0x83, 0xe4, 0xe3, 0xe3], 0x3000)?;
    let entry = Arm64RuntimeFunction {
        begin_address: 0x1000,
        data: 0x2000,
    };
    machine.tables.add_arm64_function_table(0x12, &[entry], BASE, 0x2000);

    // two stacked frames of the same function
    machine.memory.write_u64(0x7e08, BASE + 0x1010)?; // inner return address
    machine.memory.write_u64(0x7e28, BASE + 0x1014)?; // outer return address
    {
        let context = &mut machine.thread_mut(thread)?.context;
        context.rip = BASE + 0x1008;
        context.rsp = 0x7e00;
    }

    let log = Rc::new(RefCell::new(Vec::new()));
    let handler_log = Rc::clone(&log);
    machine.register_language_handler(
        BASE + 0x3000,
        frame_handler(move |record, establisher, _, _| {
            handler_log.borrow_mut().push((establisher, record.flags));
            HandlerOutcome::Disposition(Disposition::ContinueSearch)
        }),
    );

    let outcome = machine.unwind_to_target(thread, Some(0x7e40), 0x6000, None, 0x9)?;
    assert_eq!(outcome, Resumption::Continue);

    let log = log.borrow();
    assert_eq!(log.len(), 2, "each frame's handler runs exactly once");
    assert_eq!(log[0].0, 0x7e20);
    assert!(log[0].1.contains(ExceptionFlags::UNWINDING));
    assert!(!log[0].1.contains(ExceptionFlags::TARGET_UNWIND));
    assert_eq!(log[1].0, 0x7e40);
    assert!(log[1].1.contains(ExceptionFlags::TARGET_UNWIND));

    let thread_state = machine.thread(thread)?;
    assert_eq!(thread_state.context.rip, 0x6000);
    assert_eq!(thread_state.context.rax, 0x9);
    assert_eq!(thread_state.context.rsp, 0x7e20, "resumes inside the target frame");
    Ok(())
}

struct ScriptedDebugger {
    log: Rc<RefCell<Vec<&'static str>>>,
    first: DebuggerVerdict,
    second: DebuggerVerdict,
    edit_rax: Option<u64>,
}

impl DebuggerPort for ScriptedDebugger {
    fn first_chance(&mut self, _: &ExceptionRecord, context: &mut Context) -> DebuggerVerdict {
        self.log.borrow_mut().push("first");
        if let Some(value) = self.edit_rax {
            context.rax = value;
        }
        self.first
    }

    fn second_chance(&mut self, _: &ExceptionRecord, context: &mut Context) -> DebuggerVerdict {
        self.log.borrow_mut().push("second");
        if let Some(value) = self.edit_rax {
            context.rax = value;
        }
        self.second
    }
}

#[test]
fn debugger_gets_both_chances_around_the_handler_search() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X86);
    let log = Rc::new(RefCell::new(Vec::new()));
    machine.set_debugger(Some(Box::new(ScriptedDebugger {
        log: Rc::clone(&log),
        first: DebuggerVerdict::NotHandled,
        second: DebuggerVerdict::Handled,
        edit_rax: Some(1),
    })));

    let record = ExceptionRecord::new(ExceptionCode::IllegalInstruction, 0x5000);
    let context = machine.thread(thread)?.context;
    let outcome = machine.raise_exception(thread, record, context, true)?;
    assert_eq!(outcome, Resumption::Continue);
    assert_eq!(*log.borrow(), vec!["first", "second"]);
    assert_eq!(machine.thread(thread)?.context.rax, 1);
    Ok(())
}

#[test]
fn debugger_edits_are_hidden_from_handlers_unless_enabled() -> Result<()> {
    for (visible, expected) in [(false, 0u64), (true, 0xed17u64)] {
        let (mut machine, thread) = machine_with_thread(Arch::X86);
        machine.set_debugger_edits_visible(visible);
        machine.set_debugger(Some(Box::new(ScriptedDebugger {
            log: Rc::new(RefCell::new(Vec::new())),
            first: DebuggerVerdict::NotHandled,
            second: DebuggerVerdict::Handled,
            edit_rax: Some(0xed17),
        })));

        let seen = Rc::new(Cell::new(0u64));
        let observer = Rc::clone(&seen);
        machine.thread_mut(thread)?.push_frame(
            0x1f00,
            frame_handler(move |_, _, context, _| {
                observer.set(context.rax);
                HandlerOutcome::Disposition(Disposition::ContinueSearch)
            }),
        );

        let record = ExceptionRecord::new(ExceptionCode::IllegalInstruction, 0x5000);
        let context = machine.thread(thread)?.context;
        machine.raise_exception(thread, record, context, true)?;
        assert_eq!(seen.get(), expected, "visible={visible}");
    }
    Ok(())
}

#[test]
fn continue_handlers_run_only_after_frame_exhaustion() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X86);
    let log = Rc::new(RefCell::new(Vec::new()));

    let frame_log = Rc::clone(&log);
    machine.thread_mut(thread)?.push_frame(
        0x1f00,
        frame_handler(move |_, _, _, _| {
            frame_log.borrow_mut().push("frame");
            HandlerOutcome::Disposition(Disposition::ContinueSearch)
        }),
    );
    let continue_log = Rc::clone(&log);
    machine.add_vectored_continue_handler(
        false,
        vectored(move |_, _| {
            continue_log.borrow_mut().push("continue");
            VectoredDisposition::ContinueExecution
        }),
    );

    let record = ExceptionRecord::new(ExceptionCode::IllegalInstruction, 0x5000);
    let context = machine.thread(thread)?.context;
    let outcome = machine.raise_exception(thread, record, context, true)?;
    assert_eq!(outcome, Resumption::Continue);
    assert_eq!(*log.borrow(), vec!["frame", "continue"]);
    Ok(())
}

#[test]
fn continuing_a_noncontinuable_exception_is_fatal() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X86);
    machine.thread_mut(thread)?.push_frame(
        0x1f00,
        frame_handler(|_, _, _, _| HandlerOutcome::Disposition(Disposition::ContinueExecution)),
    );

    let record =
        ExceptionRecord::new(ExceptionCode::IllegalInstruction, 0x5000).noncontinuable();
    let context = machine.thread(thread)?.context;
    let outcome = machine.raise_exception(thread, record, context, true)?;
    assert_eq!(
        outcome,
        Resumption::Terminated { code: 0xc000_0025 },
        "the follow-up exception is itself noncontinuable and nothing handles it"
    );
    Ok(())
}

#[test]
fn unhandled_filter_is_the_last_stop_before_termination() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X86);
    let record = ExceptionRecord::new(ExceptionCode::IllegalInstruction, 0x5000);
    let context = machine.thread(thread)?.context;
    let outcome = machine.raise_exception(thread, record.clone(), context, true)?;
    assert_eq!(outcome, Resumption::Terminated { code: 0xc000_001d });

    machine.set_unhandled_filter(Some(Rc::new(|_: &ExceptionRecord, context: &mut Context| {
        context.rip += 2;
        VectoredDisposition::ContinueExecution
    })));
    let outcome = machine.raise_exception(thread, record, context, true)?;
    assert_eq!(outcome, Resumption::Continue);
    Ok(())
}

#[test]
fn apcs_queued_during_an_unwind_run_after_it_finishes() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X86);
    machine.thread_mut(thread)?.push_frame(
        0x1f00,
        frame_handler(|_, _, _, _| HandlerOutcome::Disposition(Disposition::ContinueSearch)),
    );

    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    machine.queue_apc(
        thread,
        Rc::new(move |machine: &mut Machine, id| {
            // by the time this runs the unwind must be over
            assert!(!machine.thread(id).unwrap().unwinding());
            flag.set(true);
        }),
    )?;

    machine.unwind_to_target(thread, Some(0x1f00), 0x6000, None, 0)?;
    assert!(ran.get());
    Ok(())
}

#[test]
fn vectored_handler_registration_order_and_removal() -> Result<()> {
    let (mut machine, thread) = machine_with_thread(Arch::X86);
    let log = Rc::new(RefCell::new(Vec::new()));

    let back_log = Rc::clone(&log);
    machine.add_vectored_exception_handler(
        false,
        vectored(move |_, _| {
            back_log.borrow_mut().push("back");
            VectoredDisposition::ContinueSearch
        }),
    );
    let front_log = Rc::clone(&log);
    let front = machine.add_vectored_exception_handler(
        true,
        vectored(move |_, _| {
            front_log.borrow_mut().push("front");
            VectoredDisposition::ContinueSearch
        }),
    );

    let record = ExceptionRecord::new(ExceptionCode::IllegalInstruction, 0x5000);
    let context = machine.thread(thread)?.context;
    machine.raise_exception(thread, record.clone(), context, true)?;
    assert_eq!(*log.borrow(), vec!["front", "back"]);

    assert!(machine.remove_vectored_exception_handler(front));
    assert!(!machine.remove_vectored_exception_handler(front));
    log.borrow_mut().clear();
    machine.raise_exception(thread, record, context, true)?;
    assert_eq!(*log.borrow(), vec!["back"]);
    Ok(())
}
