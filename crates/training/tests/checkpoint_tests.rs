use std::{fs, path::PathBuf};

use anyhow::Result;
use candle_core::Device;
use model::{EncoderConfig, SeqEncoder};
use training::{checkpoint, RunConfig};

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "seq-encoder-ckpt-{}-{}",
        name,
        std::process::id()
    ));
    fs::remove_dir_all(&dir).ok();
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn small_run_config() -> RunConfig {
    let mut config = RunConfig::title();
    config.vocab_size = 12;
    config.embedding_size = 4;
    config.hidden_size = 6;
    config.num_layers = 2;
    config
}

fn encoder_for(config: &RunConfig) -> Result<SeqEncoder> {
    Ok(SeqEncoder::new(EncoderConfig {
        vocab_size: config.vocab_size,
        embedding_size: config.embedding_size,
        hidden_size: config.hidden_size,
        num_layers: config.num_layers,
        keep_prob: config.keep_prob,
        init_scale: config.init_scale,
        device: Device::Cpu,
    })?)
}

fn parameter_values(encoder: &SeqEncoder) -> Result<Vec<(String, Vec<f32>)>> {
    let mut values = Vec::new();
    for (name, var) in encoder.named_parameters() {
        values.push((name, var.as_tensor().flatten_all()?.to_vec1::<f32>()?));
    }
    Ok(values)
}

#[test]
fn save_then_restore_reproduces_parameters_and_step() -> Result<()> {
    let dir = temp_dir("roundtrip");
    let config = small_run_config();

    let saved_model = encoder_for(&config)?;
    checkpoint::save_checkpoint(&dir, &saved_model, 42, &config)?;

    // A second instance starts from a different random initialization.
    let restored_model = encoder_for(&config)?;
    let descriptor = checkpoint::latest_checkpoint(&dir)?.expect("snapshot exists");
    let global_step = checkpoint::restore_model(&restored_model, &descriptor)?;

    assert_eq!(global_step, 42);
    let expected = parameter_values(&saved_model)?;
    let actual = parameter_values(&restored_model)?;
    assert_eq!(expected, actual);

    fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
fn create_or_load_reports_step_zero_without_snapshots() -> Result<()> {
    let dir = temp_dir("fresh");
    let config = small_run_config();
    let model = encoder_for(&config)?;

    let global_step = checkpoint::create_or_load(&model, &dir, "train")?;

    assert_eq!(global_step, 0);

    fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
fn create_or_load_is_idempotent() -> Result<()> {
    let dir = temp_dir("idempotent");
    let config = small_run_config();
    let model = encoder_for(&config)?;
    checkpoint::save_checkpoint(&dir, &model, 7, &config)?;

    let other = encoder_for(&config)?;
    let first = checkpoint::create_or_load(&other, &dir, "valid")?;
    let after_first = parameter_values(&other)?;
    let second = checkpoint::create_or_load(&other, &dir, "valid")?;
    let after_second = parameter_values(&other)?;

    assert_eq!(first, 7);
    assert_eq!(second, 7);
    assert_eq!(after_first, after_second);

    fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
fn latest_resolution_picks_the_highest_step() -> Result<()> {
    let dir = temp_dir("latest");
    let config = small_run_config();
    let model = encoder_for(&config)?;

    checkpoint::save_checkpoint(&dir, &model, 3, &config)?;
    checkpoint::save_checkpoint(&dir, &model, 12, &config)?;

    let descriptor = checkpoint::latest_checkpoint(&dir)?.expect("snapshot exists");
    assert_eq!(descriptor.manifest.global_step, 12);

    fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
fn restoring_into_a_mismatched_architecture_is_fatal() -> Result<()> {
    let dir = temp_dir("mismatch");
    let config = small_run_config();
    let model = encoder_for(&config)?;
    checkpoint::save_checkpoint(&dir, &model, 5, &config)?;

    let mut wider = small_run_config();
    wider.hidden_size = 10;
    let incompatible = encoder_for(&wider)?;
    let descriptor = checkpoint::latest_checkpoint(&dir)?.expect("snapshot exists");

    assert!(checkpoint::restore_model(&incompatible, &descriptor).is_err());

    fs::remove_dir_all(&dir).ok();
    Ok(())
}
