//! Shows how planning changes as cached nodes get computed.
//!
//! Run with `RUST_LOG=lazybeam=debug` to see planning and execution logs.

use anyhow::Result;
use lazybeam::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let p = Pipeline::default();
    let orders = from_vec(
        &p,
        vec![
            ("apple".to_string(), 5u64),
            ("banana".to_string(), 3),
            ("apple".to_string(), 2),
            ("banana".to_string(), 7),
            ("cherry".to_string(), 1),
        ],
    );

    // Diamond: one cleaned input feeding two consumers.
    let cleaned = orders
        .filter_named("drop empty", |(_, qty): &(String, u64)| *qty > 0)
        .map_named("uppercase", |(k, v): &(String, u64)| (k.to_uppercase(), *v))
        .cache();
    let totals = cleaned.combine_values(Sum::<u64>::new());
    let largest = cleaned.map(|(_, v): &(String, u64)| *v).max();

    println!("=== Before any run ===\n");
    println!("{}", build_plan(&p, &[totals.node_id(), largest.node()])?.explain());

    println!("largest order: {:?}", largest.get()?);

    println!("\n=== After the cached node was computed ===\n");
    println!("{}", totals.explain()?);

    for (product, qty) in &totals.materialize()? {
        println!("{product}: {qty}");
    }
    Ok(())
}
