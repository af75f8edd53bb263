use std::{fs, path::PathBuf, sync::Arc};

use anyhow::Result;
use candle_core::Device;
use training::{
    data::{EOS_ID, UNK_ID},
    BatchSource, LineBatcher, Vocabulary,
};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("seq-encoder-data-{}-{}", name, std::process::id()))
}

fn write_file(name: &str, contents: &str) -> PathBuf {
    let path = temp_path(name);
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn vocabulary_ranks_by_frequency_then_word() -> Result<()> {
    let path = write_file("vocab-rank", "the cat sat\nthe cat\nthe dog\n");

    let vocab = Vocabulary::build_from_file(&path, 10)?;

    assert_eq!(vocab.len(), 6);
    assert_eq!(vocab.lookup("the"), 2);
    assert_eq!(vocab.lookup("cat"), 3);
    // "dog" and "sat" tie on frequency; lexicographic order breaks the tie.
    assert_eq!(vocab.lookup("dog"), 4);
    assert_eq!(vocab.lookup("sat"), 5);
    assert_eq!(vocab.lookup("zebra"), UNK_ID);

    fs::remove_file(&path).ok();
    Ok(())
}

#[test]
fn vocabulary_truncates_to_requested_size() -> Result<()> {
    let path = write_file("vocab-trunc", "the cat sat\nthe cat\nthe dog\n");

    let vocab = Vocabulary::build_from_file(&path, 4)?;

    assert_eq!(vocab.len(), 4);
    assert_eq!(vocab.lookup("the"), 2);
    assert_eq!(vocab.lookup("cat"), 3);
    assert_eq!(vocab.lookup("sat"), UNK_ID);

    fs::remove_file(&path).ok();
    Ok(())
}

#[test]
fn vocabulary_survives_save_and_load() -> Result<()> {
    let source = write_file("vocab-save-src", "alpha beta beta gamma\n");
    let saved = temp_path("vocab-save-dst");

    let vocab = Vocabulary::build_from_file(&source, 8)?;
    vocab.save(&saved)?;
    let reloaded = Vocabulary::load(&saved)?;

    assert_eq!(reloaded.len(), vocab.len());
    for word in ["alpha", "beta", "gamma", "missing"] {
        assert_eq!(reloaded.lookup(word), vocab.lookup(word));
    }

    fs::remove_file(&source).ok();
    fs::remove_file(&saved).ok();
    Ok(())
}

fn frequency_vocab() -> (PathBuf, Arc<Vocabulary>) {
    // Frequencies force ids: a=2, b=3, c=4, d=5.
    let path = write_file("batcher-vocab", "a a a a b b b c c d\n");
    let vocab = Arc::new(Vocabulary::build_from_file(&path, 10).unwrap());
    (path, vocab)
}

#[test]
fn batcher_windows_and_pads_lines() -> Result<()> {
    let (vocab_path, vocab) = frequency_vocab();
    let data = write_file("batcher-window", "a b c d e\na b\n");

    let mut batcher = LineBatcher::new(&data, vocab, 2, 3, Device::Cpu)?;
    batcher.reset()?;

    // Line one: ids [2,3,4,5,<unk>,<eos>] tiles into a full window and a
    // two-step remainder; line two contributes one two-step window.
    let batch = batcher.next_batch()?.expect("first batch");
    assert_eq!(batch.source.dims(), &[2, 3]);
    assert_eq!(batch.target.dims(), &[2, 3]);
    assert_eq!(batch.lengths, vec![3, 2]);
    assert_eq!(batch.token_count(), 5);

    let source = batch.source.to_vec2::<u32>()?;
    let target = batch.target.to_vec2::<u32>()?;
    assert_eq!(source[0], vec![2, 3, 4]);
    assert_eq!(target[0], vec![3, 4, 5]);
    assert_eq!(source[1], vec![5, UNK_ID, EOS_ID]);
    assert_eq!(target[1], vec![UNK_ID, EOS_ID, EOS_ID]);

    // One window remains; it cannot fill a batch, so the epoch ends.
    assert!(batcher.next_batch()?.is_none());

    fs::remove_file(&vocab_path).ok();
    fs::remove_file(&data).ok();
    Ok(())
}

#[test]
fn batcher_emits_partial_batches_when_allowed() -> Result<()> {
    let (vocab_path, vocab) = frequency_vocab();
    let data = write_file("batcher-partial", "a b c d e\na b\n");

    let mut batcher =
        LineBatcher::new(&data, vocab, 2, 3, Device::Cpu)?.with_allow_partial(true);
    batcher.reset()?;

    assert_eq!(batcher.next_batch()?.expect("full batch").batch_size(), 2);
    let tail = batcher.next_batch()?.expect("partial batch");
    assert_eq!(tail.batch_size(), 1);
    assert_eq!(tail.lengths, vec![2]);
    assert!(batcher.next_batch()?.is_none());

    fs::remove_file(&vocab_path).ok();
    fs::remove_file(&data).ok();
    Ok(())
}

#[test]
fn reset_rewinds_to_the_start_of_the_stream() -> Result<()> {
    let (vocab_path, vocab) = frequency_vocab();
    let data = write_file("batcher-reset", "a b c\nb c d\n");

    let mut batcher = LineBatcher::new(&data, vocab, 2, 4, Device::Cpu)?;
    batcher.reset()?;
    let first = batcher.next_batch()?.expect("batch before rewind");
    assert!(batcher.next_batch()?.is_none());

    batcher.reset()?;
    let again = batcher.next_batch()?.expect("batch after rewind");
    assert_eq!(first.lengths, again.lengths);
    assert_eq!(
        first.source.to_vec2::<u32>()?,
        again.source.to_vec2::<u32>()?
    );

    fs::remove_file(&vocab_path).ok();
    fs::remove_file(&data).ok();
    Ok(())
}

#[test]
fn batcher_requires_reset_before_use() -> Result<()> {
    let (vocab_path, vocab) = frequency_vocab();
    let data = write_file("batcher-noreset", "a b c\n");

    let mut batcher = LineBatcher::new(&data, vocab, 1, 3, Device::Cpu)?;
    assert!(batcher.next_batch().is_err());

    fs::remove_file(&vocab_path).ok();
    fs::remove_file(&data).ok();
    Ok(())
}
