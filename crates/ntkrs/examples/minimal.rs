//! Minimal empirical NTK example
//!
//! This example demonstrates:
//! - Building a small CNN from stax-style layers
//! - Computing a test-train NTK with every strategy
//! - Checking that the strategies agree
//! - Inspecting the AUTO cost table
//!
//! Run with `RUST_LOG=debug` to see strategy dispatch.

use ntkrs::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    println!("ntkrs - Minimal Empirical NTK Example");
    println!("=====================================\n");

    let mut rng = StdRng::seed_from_u64(1);
    let x1 = NtTree::leaf(DenseND::<f64>::random_normal(&[6, 8, 8, 3], 0.0, 1.0, &mut rng)?);
    let x2 = NtTree::leaf(DenseND::<f64>::random_normal(&[3, 8, 8, 3], 0.0, 1.0, &mut rng)?);

    // A vanilla CNN
    let net: Network<f64> = Network::from_boxed(stax::serial(vec![
        stax::conv(32, (3, 3)),
        stax::relu(),
        stax::conv(32, (3, 3)),
        stax::relu(),
        stax::conv(32, (3, 3)),
        stax::flatten(),
        stax::dense(10),
    ]));
    let (_, params) = net.init_fn(3, &NtTree::leaf(vec![6, 8, 8, 3]))?;
    println!("Parameters: {}\n", params.size());

    let config = NtkConfig::new()
        .with_trace_axes(TraceAxes::none())
        .with_vmap_axes(0isize);

    let mut kernels = Vec::new();
    for implementation in [
        NtkImplementation::JacobianContraction,
        NtkImplementation::NtkVectorProducts,
        NtkImplementation::StructuredDerivatives,
        NtkImplementation::Auto,
    ] {
        let kernel_fn = build_kernel_fn_with_config(
            net.clone(),
            config.clone().with_implementation(implementation),
        )?;
        let start = std::time::Instant::now();
        // (6, 3, 10, 10) test-train NTK
        let ntk = kernel_fn.call(&x2, &x1, &params)?;
        let shape = ntk
            .as_leaf()
            .map(|k| k.shape().to_vec())
            .unwrap_or_default();
        println!(
            "{:<24} shape {:?} in {:.2?}",
            implementation.name(),
            shape,
            start.elapsed()
        );
        kernels.push((implementation, ntk));
    }

    // AUTO's view of this problem
    let auto = build_kernel_fn_with_config(
        net.clone(),
        config.clone().with_implementation(NtkImplementation::Auto),
    )?;
    let selection = auto.select(&x2, &x1, &params)?;
    println!("\nAUTO cost table:");
    for cost in &selection.candidates {
        println!(
            "  {:<24} {:>12.3e} flops {:>12} bytes{}",
            cost.implementation.name(),
            cost.flops,
            cost.peak_memory,
            if cost.implementation == selection.chosen {
                "  <- chosen"
            } else {
                ""
            }
        );
    }

    // Check that implementations match
    println!();
    for (a, ntk1) in &kernels {
        for (b, ntk2) in &kernels {
            let diff = ntk1.max_abs_diff(ntk2)?;
            println!("NTK implementation diff {} vs {}: {:e}", a, b, diff);
            anyhow::ensure!(diff < 1e-4, "{} and {} disagree by {}", a, b, diff);
        }
    }

    println!("\nAll NTK implementations match.");
    Ok(())
}
