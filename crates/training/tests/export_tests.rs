use std::{fs, path::PathBuf};

use anyhow::Result;
use candle_core::Device;
use model::{EncoderConfig, SeqEncoder};
use training::export::{write_softmax_weights, EmbeddingWriter};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "seq-encoder-export-{}-{}",
        name,
        std::process::id()
    ))
}

#[test]
fn softmax_export_writes_one_ordered_line_per_vocab_id() -> Result<()> {
    let vocab_size = 5;
    let hidden_size = 3;
    let encoder = SeqEncoder::new(EncoderConfig {
        vocab_size,
        embedding_size: 2,
        hidden_size,
        num_layers: 1,
        keep_prob: 1.0,
        init_scale: 0.05,
        device: Device::Cpu,
    })?;
    let columns = encoder.norm_softmax_w()?.t()?.to_vec2::<f32>()?;
    let path = temp_path("softmax");

    write_softmax_weights(&path, &columns)?;

    let contents = fs::read_to_string(&path)?;
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), vocab_size);
    for (id, line) in lines.iter().enumerate() {
        let (prefix, values) = line.split_once('\t').expect("tab separated");
        assert_eq!(prefix, id.to_string());
        let parsed: Vec<f32> = values
            .split(',')
            .map(|value| value.parse().expect("float value"))
            .collect();
        assert_eq!(parsed.len(), hidden_size);
        let norm: f32 = parsed.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    fs::remove_file(&path).ok();
    Ok(())
}

#[test]
fn embedding_writer_streams_rows_in_order() -> Result<()> {
    let path = temp_path("embedding");

    let mut writer = EmbeddingWriter::create(&path)?;
    writer.push_row(&[1.0, 0.0, 0.0])?;
    writer.push_row(&[0.0, -0.5, 0.5])?;
    let rows = writer.finish()?;
    assert_eq!(rows, 2);

    let contents = fs::read_to_string(&path)?;
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "1,0,0");
    assert_eq!(lines[1].split(',').count(), 3);

    fs::remove_file(&path).ok();
    Ok(())
}
