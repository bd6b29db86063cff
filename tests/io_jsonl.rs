#![cfg(feature = "io-jsonl")]

use anyhow::Result;
use lazybeam::testing::assert_run_succeeded;
use lazybeam::*;
use serde::{Deserialize, Serialize};
use std::fs;
use tempfile::tempdir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reading {
    sensor: String,
    value: u32,
}

fn readings() -> Vec<Reading> {
    vec![
        Reading {
            sensor: "north".into(),
            value: 4,
        },
        Reading {
            sensor: "south".into(),
            value: 11,
        },
        Reading {
            sensor: "north".into(),
            value: 7,
        },
    ]
}

#[test]
fn read_and_write_jsonl_vec() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("nested/readings.jsonl");

    assert_eq!(write_jsonl_vec(&path, &readings(), false)?, 3);
    assert_eq!(read_jsonl_vec::<Reading>(&path)?, readings());

    write_jsonl_vec(&path, &readings()[..1], true)?;
    assert_eq!(read_jsonl_vec::<Reading>(&path)?.len(), 4);
    Ok(())
}

#[test]
fn blank_lines_are_skipped_and_bad_lines_reported() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("mixed.jsonl");
    fs::write(&path, "{\"sensor\":\"a\",\"value\":1}\n\n   \n{\"sensor\":\"b\",\"value\":2}\n")?;
    assert_eq!(read_jsonl_vec::<Reading>(&path)?.len(), 2);

    fs::write(&path, "{\"sensor\":\"a\",\"value\":1}\nnot json\n")?;
    let err = read_jsonl_vec::<Reading>(&path).unwrap_err();
    assert!(format!("{err:#}").contains("line 2"));
    Ok(())
}

#[test]
fn pipeline_reads_and_writes_jsonl() -> Result<()> {
    let dir = tempdir()?;
    let input = dir.path().join("in.jsonl");
    let output = dir.path().join("out.jsonl");
    write_jsonl_vec(&input, &readings(), false)?;

    let p = Pipeline::default();
    let totals = from_jsonl::<Reading>(&p, &input)
        .map(|r: &Reading| (r.sensor.clone(), u64::from(r.value)))
        .combine_values(Sum::<u64>::new());
    totals.write_jsonl(&output, WriteMode::Default)?;

    // Nothing is read or written until a run includes the write.
    assert!(!output.exists());
    assert_run_succeeded(&Runner::default().run_all(&p)?);

    let written: Vec<(String, u64)> = read_jsonl_vec(&output)?;
    assert_eq!(written, vec![("north".to_string(), 11), ("south".to_string(), 11)]);
    Ok(())
}

#[test]
fn existing_output_with_default_mode_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let output = dir.path().join("taken.jsonl");
    fs::write(&output, "")?;

    let p = Pipeline::default();
    let err = from_vec(&p, vec![1u32]).write_jsonl(&output, WriteMode::Default).unwrap_err();
    assert!(matches!(err, GraphError::TargetExists(_)));
    Ok(())
}

#[test]
fn checkpoint_keeps_existing_output() -> Result<()> {
    let dir = tempdir()?;
    let output = dir.path().join("checkpoint.jsonl");
    write_jsonl_vec(&output, &[42u32], false)?;

    let p = Pipeline::default();
    from_vec(&p, vec![1u32, 2, 3]).write_jsonl(&output, WriteMode::Checkpoint)?;
    assert_run_succeeded(&Runner::default().run_all(&p)?);
    assert_eq!(read_jsonl_vec::<u32>(&output)?, vec![42]);
    Ok(())
}

#[test]
fn missing_input_fails_the_stage_as_data_error() -> Result<()> {
    let dir = tempdir()?;
    let p = Pipeline::default();
    let missing = from_jsonl::<Reading>(&p, dir.path().join("absent.jsonl"));

    let result = Runner::default().run(&p, &[missing.node_id()])?;
    assert_eq!(result.status(), RunStatus::Failed);
    assert_eq!(result.failure.map(|f| f.kind), Some(FailureKind::DataError));
    Ok(())
}
