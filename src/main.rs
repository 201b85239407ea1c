/*!
Benchmark/demo driver for the kernel simulator.

Runs a predefined workload under a chosen scheduling strategy and prints
turnaround/utilization statistics, optionally dumping the final snapshot as
JSON. The tick cadence lives here, not in the core: the kernel is stepped
in a plain loop with an optional host-side sleep between ticks.
*/

use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::error;

use osim::{Instruction as I, Kernel, Strategy};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StrategyArg {
    Fifo,
    Sjf,
    Srt,
    Mlf,
    RtFifo,
    RtEdf,
    RtLst,
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Fifo => Strategy::Fifo,
            StrategyArg::Sjf => Strategy::Sjf,
            StrategyArg::Srt => Strategy::Srt,
            StrategyArg::Mlf => Strategy::Mlf,
            StrategyArg::RtFifo => Strategy::RtFifo,
            StrategyArg::RtEdf => Strategy::RtEdf,
            StrategyArg::RtLst => Strategy::RtLst,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Workload {
    /// Five identical short compute workers.
    Uniform,
    /// Two long workers plus a stream of short arrivals.
    Mixed,
    /// Compute workers that block on I/O mid-run.
    Io,
    /// Periodic real-time jobs with deadlines.
    Rt,
}

#[derive(Parser, Debug)]
#[command(name = "osim", about = "Deterministic multi-core OS-kernel simulator")]
struct Args {
    /// Scheduling strategy.
    #[arg(long, value_enum, default_value_t = StrategyArg::Fifo)]
    strategy: StrategyArg,

    /// Number of simulated cores.
    #[arg(long, default_value_t = 2)]
    cores: usize,

    /// Number of simulated I/O devices.
    #[arg(long, default_value_t = 1)]
    devices: usize,

    /// Workload to drive.
    #[arg(long, value_enum, default_value_t = Workload::Uniform)]
    workload: Workload,

    /// Number of ticks to simulate.
    #[arg(long, default_value_t = 400)]
    ticks: u64,

    /// Milliseconds to sleep between ticks (0 = run flat out).
    #[arg(long, default_value_t = 0)]
    clock_delay: u64,

    /// Dump the final snapshot as JSON instead of statistics.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut kernel = Kernel::new(args.cores, args.devices, args.strategy.into());
    kernel.set_clock_delay(args.clock_delay);
    seed_workload(&mut kernel, args.workload);

    let mut used_cpu_time = 0u64;
    let mut total_cpu_time = 0u64;

    for _ in 0..args.ticks {
        if let Err(err) = kernel.tick() {
            error!("simulation aborted: {err}");
            return ExitCode::FAILURE;
        }
        total_cpu_time += kernel.num_cores() as u64;
        used_cpu_time += kernel.busy_cores() as u64;

        feed_workload(&mut kernel, args.workload);

        if args.clock_delay > 0 {
            thread::sleep(Duration::from_millis(kernel.clock_delay()));
        }
    }

    if args.json {
        match serde_json::to_string_pretty(&kernel.snapshot()) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                error!("snapshot serialization failed: {err}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_stats(&kernel, used_cpu_time, total_cpu_time);
    }
    ExitCode::SUCCESS
}

/// Register programs and initial processes for the chosen workload.
fn seed_workload(kernel: &mut Kernel, workload: Workload) {
    let worker: Vec<I> = (0..9).map(|_| I::work()).chain([I::exit()]).collect();
    let short: Vec<I> = (0..2).map(|_| I::work()).chain([I::exit()]).collect();
    let long: Vec<I> = (0..255).map(|_| I::work()).chain([I::exit()]).collect();
    let io_worker = [I::work(), I::work(), I::work(), I::io(5), I::exit()];

    kernel.load_program("worker", &worker);
    kernel.load_program("short worker", &short);
    kernel.load_program("long worker", &long);
    kernel.load_program("io worker", &io_worker);

    match workload {
        Workload::Uniform => {
            for _ in 0..5 {
                kernel.spawn("worker").expect("worker registered");
            }
        }
        Workload::Mixed => {
            kernel.spawn("long worker").expect("long worker registered");
            kernel.spawn("long worker").expect("long worker registered");
            kernel.spawn("worker").expect("worker registered");
        }
        Workload::Io => {
            kernel.spawn("io worker").expect("io worker registered");
            kernel.spawn("io worker").expect("io worker registered");
            kernel.spawn("long worker").expect("long worker registered");
        }
        Workload::Rt => {
            kernel
                .dispatch("short worker", 10, 6, 2)
                .expect("short worker registered");
            kernel
                .dispatch("worker", 25, 20, 5)
                .expect("worker registered");
        }
    }
}

/// Periodic arrivals, mirroring the benchmark shapes: a short worker every
/// ten ticks (mixed) or bursts early in the run (I/O).
fn feed_workload(kernel: &mut Kernel, workload: Workload) {
    let now = kernel.time();
    match workload {
        Workload::Mixed if now % 10 == 0 && now <= 300 => {
            kernel.spawn("short worker").expect("short worker registered");
        }
        Workload::Io if now % 2 == 0 && now <= 6 => {
            kernel.spawn("short worker").expect("short worker registered");
            kernel.spawn("short worker").expect("short worker registered");
        }
        _ => {}
    }
}

fn print_stats(kernel: &Kernel, used_cpu_time: u64, total_cpu_time: u64) {
    println!("Strategy: {}", kernel.strategy());

    let turnarounds: Vec<u64> = kernel
        .processes()
        .filter_map(|p| p.done_time.map(|done| done - p.arrival_time))
        .collect();
    let finished = turnarounds.len();
    let admitted = kernel.processes().count();

    if finished == 0 {
        println!("No process finished in the tick budget.");
        return;
    }

    let att = turnarounds.iter().sum::<u64>() as f64 / finished as f64;
    let max_tt = turnarounds.iter().max().copied().unwrap_or(0);
    let min_tt = turnarounds.iter().min().copied().unwrap_or(0);
    let utilization = used_cpu_time as f64 / total_cpu_time as f64 * 100.0;

    println!("Processes finished: {finished}/{admitted}");
    println!("ATT: {att:.2} quanta");
    println!("CPU Utilization: {utilization:.1}%");
    println!("Max TT: {max_tt} quanta");
    println!("Min TT: {min_tt} quanta");
}
