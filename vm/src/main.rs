use std::sync::Arc;

use clap::Parser as ClapParser;
use heap::HeapSettings;
use log::info;
use object::{ClassId, MethodId, Ref};

use ember::arrays::RefArray;
use ember::clock::SystemClock;
use ember::frame::FrameLayout;
use ember::metadata::{ClassDescriptor, Metadata, MetadataStore, MethodDescriptor, classes};
use ember::objects::Object;
use ember::threading::Thread;
use ember::{Vm, VmError, VmSettings, natives};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Arena size in bytes
    #[arg(long, default_value_t = 8192)]
    heap_size: usize,

    /// Objects each thread allocates
    #[arg(long, default_value_t = 400)]
    objects: u32,

    /// Keep every n-th object alive, drop the rest
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
    keep_every: u32,

    /// Threads running the workload one after another
    #[arg(long, default_value_t = 2)]
    threads: u16,

    /// Native stack budget in bytes, 0 disables the probe
    #[arg(long, default_value_t = 64 * 1024)]
    stack_budget: usize,
}

struct Workload {
    node: ClassDescriptor,
    run: MethodId,
}

fn metadata() -> (MetadataStore, ClassId, MethodId) {
    let mut store = MetadataStore::new();
    let node = store.add_class("Node", Some(classes::OBJECT), 1, 4);
    let main = store.add_class("Main", Some(classes::OBJECT), 0, 0);
    let run = store.add_method(
        main,
        MethodDescriptor {
            name: "run".into(),
            is_static: true,
            code_length: 1,
            ref_locals: 2,
            max_ref_stack: 2,
            max_int_stack: 6,
            ..MethodDescriptor::default()
        },
    );
    (store, node, run)
}

/// Reference local `index` of the current thread's top frame.
fn local(vm: &Vm, index: u16) -> Ref {
    let frame = vm.current_frame();
    let layout = FrameLayout::for_frame(&vm.heap, &*vm.metadata, frame);
    frame.ref_local(&vm.heap, &layout, index)
}

fn set_local(vm: &mut Vm, index: u16, value: Ref) {
    let frame = vm.current_frame();
    let layout = FrameLayout::for_frame(&vm.heap, &*vm.metadata, frame);
    frame.set_ref_local(&mut vm.heap, &layout, index, value);
}

/// Allocate `cli.objects` nodes on `thread`, keeping every n-th one in a
/// frame-local array and linking the kept ones into a list. Returns how many
/// kept nodes were found intact afterwards.
fn run_thread(vm: &mut Vm, work: &Workload, cli: &Cli, thread: Thread) -> Result<u32, VmError> {
    let slot = vm.protect(thread.0);
    let frame = vm.create_frame(work.run)?;
    let thread = Thread(vm.protected(slot));
    vm.push_frame(thread, frame);
    vm.set_current_thread(Some(thread));

    let kept = cli.objects.div_ceil(cli.keep_every);
    let keep = vm.new_ref_array(work.node.id, kept)?;
    set_local(vm, 0, keep.0);

    for i in 0..cli.objects {
        let obj = vm.new_object(work.node.id)?;
        obj.write_int(&mut vm.heap, &work.node, 0, i as i32);
        if i % cli.keep_every != 0 {
            continue;
        }
        let index = (i / cli.keep_every) as i32;
        let keep = RefArray(local(vm, 0));
        keep.set(&mut vm.heap, index, obj.0)?;
        if index > 0 {
            let prev = Object(keep.get(&vm.heap, index - 1)?);
            prev.set_field(&mut vm.heap, 0, obj.0);
        }
    }

    // snapshot the kept nodes into an Object[] through the native
    let copy = vm.new_ref_array(classes::OBJECT, kept)?;
    set_local(vm, 1, copy.0);
    let keep = local(vm, 0);
    vm.push_ref(keep);
    vm.push_int(0);
    vm.push_ref(copy.0);
    vm.push_int(0);
    vm.push_int(kept as i32);
    natives::system_arraycopy(vm);

    let keep = RefArray(local(vm, 0));
    let copy = RefArray(local(vm, 1));
    let mut intact = 0;
    for k in 0..kept as i32 {
        let obj = Object(keep.get(&vm.heap, k)?);
        let value = obj.read_int(&vm.heap, &work.node, 0);
        let linked = k + 1 == kept as i32 || obj.field(&vm.heap, 0) == keep.get(&vm.heap, k + 1)?;
        if value == k * cli.keep_every as i32 && linked && copy.get(&vm.heap, k)? == obj.0 {
            intact += 1;
        }
    }

    let thread = Thread(vm.protected(slot));
    vm.pop_frame(thread);
    vm.set_current_thread(None);
    vm.release(slot);
    Ok(intact)
}

fn main() -> Result<(), VmError> {
    env_logger::init();
    let cli = Cli::parse();

    info!(
        "heap {} bytes, {} threads x {} objects, keeping every {}",
        cli.heap_size, cli.threads, cli.objects, cli.keep_every
    );
    let (store, node, run) = metadata();
    let settings = VmSettings {
        heap: HeapSettings {
            heap_size: cli.heap_size,
            ..HeapSettings::default()
        },
        native_stack_budget: (cli.stack_budget > 0).then_some(cli.stack_budget),
    };
    let mut vm = Vm::new(settings, Arc::new(store), Box::new(SystemClock::new()));
    let work = Workload {
        node: vm.metadata.class_or_abort(node).clone(),
        run,
    };

    for _ in 0..cli.threads {
        let thread = vm.create_thread()?;
        vm.start_thread(thread, Ref::NULL);
        let id = thread.id(&vm.heap);
        let intact = run_thread(&mut vm, &work, &cli, thread)?;
        println!("thread {id}: {intact}/{} kept nodes intact", cli.objects.div_ceil(cli.keep_every));
    }

    vm.collect();

    let stats = vm.stats();
    println!("collections:      {}", stats.collections);
    println!("chunks reclaimed: {}", stats.chunks_reclaimed);
    println!("bytes reclaimed:  {}", stats.bytes_reclaimed);
    println!("live bytes:       {}", stats.live_bytes);
    Ok(())
}
