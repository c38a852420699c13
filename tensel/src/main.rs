use clap::{Parser, Subcommand};
use log::info;
use std::process::ExitCode;
use std::time::Instant;

use tensel_core::array::{ArrayId, ArrayRegistry};
use tensel_core::assignments::{lower, Asgns};
use tensel_core::diags;
use tensel_core::error::Result;
use tensel_core::indexing::Projections;
use tensel_core::llir::{BinOp, Precision};
use tensel_core::memory::{HostedKind, MemoryMode};
use tensel_core::shape::{ComposeKind, InitOp, Logic, ShapeEnv, UpdateStep};
use tensel_core::{compile, OptimizeSettings, Proc};

/// Times the execution of a closure and prints the elapsed time if verbose.
fn time<T, F: FnOnce() -> T>(name: &str, verbose: bool, f: F) -> T {
    let start = Instant::now();
    let result = f();
    if verbose {
        let elapsed = start.elapsed().as_micros();
        eprintln!("{}: {}us", name, elapsed);
    }
    result
}

#[derive(Parser)]
#[command(name = "tensel")]
#[command(about = "Array-computation compiler middle-end driver", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a demonstration computation, optimize it, and dump the results
    Demo {
        /// Demo name (see `tensel list`)
        name: String,

        /// Disable integer-power unrolling
        #[arg(long)]
        no_unroll_pow: bool,

        /// Maximum traced-loop unroll during usage analysis
        #[arg(long, default_value_t = 5)]
        max_tracing_dim: usize,

        /// Dump projections and the traced-store report as JSON
        #[arg(long)]
        json: bool,

        /// Print verbose output (pass timings)
        #[arg(short, long)]
        verbose: bool,
    },

    /// List the available demos
    List,
}

const DEMOS: &[(&str, &str)] = &[
    ("pointwise-add", "broadcast add of a [3] vector and a [2]x[3] batch"),
    ("matmul", "2x3 . 3x4 inner product"),
    ("virtual-scalar", "scalar chain that inlines and folds away"),
    ("power", "integer-power unrolling of x ** 3"),
];

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::List => {
            for (name, blurb) in DEMOS {
                println!("{:16} {}", name, blurb);
            }
            Ok(())
        }
        Commands::Demo {
            name,
            no_unroll_pow,
            max_tracing_dim,
            json,
            verbose,
        } => {
            let settings = OptimizeSettings {
                unroll_integer_pow: !no_unroll_pow,
                max_tracing_dim,
                ..OptimizeSettings::default()
            };
            let demo = time("build", verbose, || build_demo(&name))?;
            info!("built demo '{}'", name);

            println!("== shapes");
            for line in &demo.shape_dump {
                println!("{}", line);
            }
            println!("\n== projections");
            for projections in &demo.projections {
                print!("{}", diags::format_projections(projections));
            }
            println!("\n== lowered");
            print!("{}", diags::format_stmt(&demo.proc.body, &demo.proc.arrays));

            let compiled = time("optimize", verbose, || compile(&name, settings, demo.proc))?;

            println!("\n== optimized");
            print!(
                "{}",
                diags::format_stmt(&compiled.optimized.proc.body, &compiled.optimized.proc.arrays)
            );
            println!("\n== storage");
            for decl in compiled.optimized.proc.arrays.iter() {
                println!(
                    "{:8} {:?}  gpu {:?}",
                    decl.label,
                    compiled.storage[&decl.id],
                    compiled.gpu_modes.get(&decl.id)
                );
            }
            if json {
                let report = compiled.optimized.store.report(&compiled.optimized.proc.arrays);
                println!("\n== json");
                println!("{}", serde_json::to_string_pretty(&demo.projections).expect("serialize"));
                println!("{}", serde_json::to_string_pretty(&report).expect("serialize"));
            }
            Ok(())
        }
    }
}

/// A built demo: the procedure plus what we printed about its inference.
struct Demo {
    proc: Proc,
    projections: Vec<Projections>,
    shape_dump: Vec<String>,
}

fn build_demo(name: &str) -> Result<Demo> {
    match name {
        "pointwise-add" => pointwise_add(),
        "matmul" => matmul(),
        "virtual-scalar" => virtual_scalar(),
        "power" => power(),
        other => Err(tensel_core::err_unsupported!(
            "unknown demo '{}'; try `tensel list`",
            other
        )),
    }
}

fn declare_from_shape(
    env: &ShapeEnv,
    arrays: &mut ArrayRegistry,
    shape: tensel_core::row::ShapeId,
    like: tensel_core::row::ShapeId,
    label: &str,
) -> Result<ArrayId> {
    let dims = env.broadcast_dims(shape, like)?;
    Ok(arrays.declare(label, Precision::Single, dims))
}

fn pointwise_add() -> Result<Demo> {
    let mut env = ShapeEnv::new();
    let mut arrays = ArrayRegistry::new();
    let t1s = env.make_shape("t1", &[], &[], &[3]);
    let t2s = env.make_shape("t2", &[2], &[], &[3]);
    let sums = env.unknown_shape("sum");
    let update = UpdateStep {
        shape: sums,
        logic: Logic::Broadcast(ComposeKind::Pointwise, t1s, t2s),
    };
    env.propagate_shapes(&update)?;
    env.finish_inference()?;
    let projections = env.derive_projections(&update)?;

    let t1 = declare_from_shape(&env, &mut arrays, t1s, sums, "t1")?;
    let t2 = declare_from_shape(&env, &mut arrays, t2s, sums, "t2")?;
    let sum_dims = env.broadcast_dims(sums, sums)?;
    let sum = arrays.declare_with_mode(
        "sum",
        Precision::Single,
        sum_dims,
        MemoryMode::Hosted(HostedKind::Changed),
    );
    let asgns = Asgns::Seq(vec![
        Asgns::Fetch {
            array: t1,
            fetch: InitOp::ConstantFill {
                values: vec![1.0],
                strict: false,
            },
        },
        Asgns::Fetch {
            array: t2,
            fetch: InitOp::RangeOverOffsets,
        },
        Asgns::AccumBinop {
            initialize_neutral: false,
            accum: BinOp::Arg2,
            op: BinOp::Add,
            lhs: sum,
            rhs1: t1,
            rhs2: t2,
            projections: projections.clone(),
        },
    ]);
    let body = lower(&arrays, &asgns)?;
    Ok(Demo {
        shape_dump: shape_lines(&env, &[t1s, t2s, sums]),
        proc: Proc::new("pointwise_add", arrays, body),
        projections: vec![projections],
    })
}

fn matmul() -> Result<Demo> {
    let mut env = ShapeEnv::new();
    let mut arrays = ArrayRegistry::new();
    let lhs_s = env.make_shape("w", &[], &[3], &[2]);
    let rhs_s = env.make_shape("x", &[], &[4], &[3]);
    let out_s = env.unknown_shape("y");
    let update = UpdateStep {
        shape: out_s,
        logic: Logic::Broadcast(ComposeKind::Compose, lhs_s, rhs_s),
    };
    env.propagate_shapes(&update)?;
    env.finish_inference()?;
    let projections = env.derive_projections(&update)?;

    let w = declare_from_shape(&env, &mut arrays, lhs_s, out_s, "w")?;
    let x = declare_from_shape(&env, &mut arrays, rhs_s, out_s, "x")?;
    let y_dims = env.broadcast_dims(out_s, out_s)?;
    let y = arrays.declare_with_mode(
        "y",
        Precision::Single,
        y_dims,
        MemoryMode::Hosted(HostedKind::Changed),
    );
    let asgns = Asgns::Seq(vec![
        Asgns::Fetch {
            array: w,
            fetch: InitOp::StandardUniform,
        },
        Asgns::Fetch {
            array: x,
            fetch: InitOp::RangeOverOffsets,
        },
        Asgns::AccumBinop {
            initialize_neutral: true,
            accum: BinOp::Add,
            op: BinOp::Mul,
            lhs: y,
            rhs1: w,
            rhs2: x,
            projections: projections.clone(),
        },
    ]);
    let body = lower(&arrays, &asgns)?;
    Ok(Demo {
        shape_dump: shape_lines(&env, &[lhs_s, rhs_s, out_s]),
        proc: Proc::new("matmul", arrays, body),
        projections: vec![projections],
    })
}

fn virtual_scalar() -> Result<Demo> {
    let mut arrays = ArrayRegistry::new();
    let t1 = arrays.declare("t1", Precision::Single, vec![]);
    let t2 = arrays.declare_with_mode(
        "t2",
        Precision::Single,
        vec![],
        MemoryMode::Hosted(HostedKind::Changed),
    );
    use tensel_core::llir::{Expr, Stmt};
    let body = Stmt::Seq(vec![
        Stmt::ZeroOut(t1),
        Stmt::Set {
            array: t1,
            idcs: vec![],
            value: Expr::Const(3.0),
        },
        Stmt::Set {
            array: t2,
            idcs: vec![],
            value: Expr::binop(BinOp::Add, Expr::Get(t1, vec![]), Expr::Const(1.0)),
        },
    ]);
    Ok(Demo {
        shape_dump: vec!["t1 []".into(), "t2 []".into()],
        proc: Proc::new("virtual_scalar", arrays, body),
        projections: vec![],
    })
}

fn power() -> Result<Demo> {
    let mut arrays = ArrayRegistry::new();
    let x = arrays.declare_with_mode(
        "x",
        Precision::Single,
        vec![],
        MemoryMode::Hosted(HostedKind::Changed),
    );
    let y = arrays.declare_with_mode(
        "y",
        Precision::Single,
        vec![],
        MemoryMode::Hosted(HostedKind::Changed),
    );
    use tensel_core::llir::{Expr, Stmt};
    let body = Stmt::Seq(vec![
        Stmt::Set {
            array: x,
            idcs: vec![],
            value: Expr::Const(1.5),
        },
        Stmt::Set {
            array: y,
            idcs: vec![],
            value: Expr::binop(BinOp::ToPowOf, Expr::Get(x, vec![]), Expr::Const(3.0)),
        },
    ]);
    Ok(Demo {
        shape_dump: vec!["x []".into(), "y []".into()],
        proc: Proc::new("power", arrays, body),
        projections: vec![],
    })
}

fn shape_lines(env: &ShapeEnv, ids: &[tensel_core::row::ShapeId]) -> Vec<String> {
    ids.iter()
        .map(|id| {
            let shape = env.shape(*id);
            format!("{:8} {}", shape.debug_label, diags::format_shape(shape))
        })
        .collect()
}
