//! `qlite` command line.
//!
//! Usage:
//!   qlite inspect model.tflite
//!   qlite convert graph.json -o model.tflite [--uint8] [--no-nchw-transpose]

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use qlite::convert::{ConverterOptions, ModelPlan, QuantizedElementType};
use qlite::ir::Graph;
use qlite::tensor::HostTensor;

#[derive(Parser)]
#[command(name = "qlite", version, about = "Quantization-aware TFLite conversion")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the operators and tensors of a TFLite model
    Inspect {
        model: PathBuf,
        /// Also list every tensor
        #[arg(long)]
        tensors: bool,
    },
    /// Optimize a dumped graph and write it as a TFLite model
    Convert {
        graph: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
        /// Converter options as JSON; flags below override it
        #[arg(long)]
        options: Option<PathBuf>,
        /// Store quantized tensors as uint8
        #[arg(long)]
        uint8: bool,
        /// Keep rank-4 inputs channel-first
        #[arg(long)]
        no_nchw_transpose: bool,
        #[arg(long)]
        description: Option<String>,
    },
}

fn main() {
    env_logger::init();

    let result = match Cli::parse().command {
        Command::Inspect { model, tensors } => cmd_inspect(&model, tensors),
        Command::Convert {
            graph,
            out,
            options,
            uint8,
            no_nchw_transpose,
            description,
        } => cmd_convert(&graph, &out, options, uint8, no_nchw_transpose, description),
    };
    if let Err(err) = result {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// inspect
// ---------------------------------------------------------------------------

fn cmd_inspect(path: &Path, list_tensors: bool) -> qlite::Result<()> {
    let plan = qlite::read_model(&fs::read(path)?)?;
    print_model(&plan, list_tensors);
    Ok(())
}

fn print_model(plan: &ModelPlan, list_tensors: bool) {
    println!("schema version {}, description {:?}", plan.version, plan.description);
    println!("{} buffers, {} operator codes", plan.buffers.len(), plan.opcodes.len());
    for (i, sg) in plan.subgraphs.iter().enumerate() {
        println!();
        println!(
            "subgraph {i} `{}`: inputs {:?} outputs {:?}, {} tensors",
            sg.name,
            sg.inputs,
            sg.outputs,
            sg.tensors.len()
        );
        for (j, op) in sg.operators.iter().enumerate() {
            let code = plan.opcode_of(op);
            let (name, version) = code.map_or(("?".to_string(), 0), |c| (format!("{:?}", c.builtin), c.version));
            println!("  {j:>3}: {name} v{version} {:?} -> {:?}", op.inputs, op.outputs);
        }
        if list_tensors {
            for (j, t) in sg.tensors.iter().enumerate() {
                let quant = t.quant.as_ref().map_or(String::new(), |q| {
                    format!(" scale {:?} zp {:?} axis {}", q.scale, q.zero_point, q.quantized_dimension)
                });
                let bytes = plan.buffers.get(t.buffer as usize).map_or(0, Vec::len);
                println!("  t{j:<3} {:?} {:?} `{}` ({bytes} bytes){quant}", t.dtype, t.shape, t.name);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// convert
// ---------------------------------------------------------------------------

fn cmd_convert(
    graph_path: &Path,
    out: &Path,
    options_path: Option<PathBuf>,
    uint8: bool,
    no_nchw_transpose: bool,
    description: Option<String>,
) -> qlite::Result<()> {
    let mut options = match options_path {
        Some(path) => ConverterOptions::from_json(&fs::read_to_string(path)?)?,
        None => ConverterOptions::default(),
    };
    if uint8 {
        options = options.target(QuantizedElementType::UInt8);
    }
    if no_nchw_transpose {
        options = options.nchw_transpose(false);
    }
    if let Some(description) = description {
        options = options.description(description);
    }

    let graph = Graph::from_json(&fs::read_to_string(graph_path)?)?;
    let inputs = sample_inputs(&graph)?;
    let (outputs, transposed) = qlite::convert_graph(graph, &inputs, out, &options)?;

    eprintln!("Wrote {}", out.display());
    for (i, nhwc) in transposed.iter().enumerate() {
        if *nhwc {
            eprintln!("  input {i} is NHWC");
        }
    }
    for (i, output) in outputs.iter().enumerate() {
        eprintln!("  output {i}: shape {:?}", output.shape);
    }
    Ok(())
}

/// Deterministic inputs in [-1, 1] matching the graph's input shapes, with
/// dynamic axes set to 1.
fn sample_inputs(graph: &Graph) -> qlite::Result<Vec<HostTensor>> {
    graph
        .inputs
        .iter()
        .map(|&id| {
            let t = graph.tensor(id);
            let shape: Vec<usize> = t
                .shape
                .iter()
                .enumerate()
                .map(|(axis, &d)| if t.dynamic_axes.contains(&axis) { 1 } else { d })
                .collect();
            let n: usize = shape.iter().product();
            let values = (0..n).map(|i| ((i % 21) as f32 - 10.0) / 10.0).collect();
            HostTensor::new(shape, values)
        })
        .collect()
}
