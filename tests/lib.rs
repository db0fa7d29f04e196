use liquid_frame::codec::Codec;
use liquid_frame::{
    Column, ColumnType, Data, Frame, FrameBuilder, Key, KeyKind, Layout,
    LiquidError, LocalCluster, Scope, Settings, Value,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.cache.max_bytes = 64 << 20;
    settings.mrtask.threads = 4;
    settings.ingest.rows_per_chunk = 1_000;
    settings
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chunk_encodings_follow_their_values() {
    let cluster = LocalCluster::start(3, settings()).unwrap();
    let node = cluster.node(1).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let n = 2_500;
    let constant = vec![7.0; n];
    let flags: Vec<Option<i64>> = (0..n).map(|i| Some((i % 2) as i64)).collect();
    let wide: Vec<f64> = (0..n).map(|_| rng.gen_range(-1e9..1e9)).collect();
    let frame = FrameBuilder::new(1_000)
        .numeric("constant", constant.clone())
        .integers("flags", flags.clone())
        .numeric("wide", wide.clone())
        .build(&node.kv)
        .await
        .unwrap();
    assert_eq!(frame.n_rows(), n);
    assert_eq!(frame.layout().n_chunks(), 3);

    // read every chunk from a node that does not own all of them
    let reader = cluster.node(2).unwrap();
    let frame = Frame::fetch(&reader.kv, &frame.key).await.unwrap();
    for cidx in 0..3 {
        let c = frame
            .column("constant")
            .unwrap()
            .chunk_for_chunk_idx(&reader.kv, cidx)
            .await
            .unwrap();
        assert_eq!(c.codec(), Codec::Constant);
        assert_eq!(c.bits_per_value(), 0);
        let f = frame
            .column("flags")
            .unwrap()
            .chunk_for_chunk_idx(&reader.kv, cidx)
            .await
            .unwrap();
        assert_eq!(f.codec(), Codec::Bits);
        assert_eq!(f.bits_per_value(), 1);
        let w = frame
            .column("wide")
            .unwrap()
            .chunk_for_chunk_idx(&reader.kv, cidx)
            .await
            .unwrap();
        assert_eq!(w.bits_per_value(), 64);

        let range = frame.layout().chunk_range(cidx).unwrap();
        assert_eq!(c.to_doubles(), constant[range.clone()].to_vec());
        for (row, expected) in range.clone().zip(&flags[range.clone()]) {
            assert_eq!(f.at(row - range.start).unwrap(), Data::Int(expected.unwrap()));
        }
        assert_eq!(w.to_doubles(), wide[range].to_vec());
    }
}

#[tokio::test]
async fn test_homes_agree_across_nodes() {
    let cluster = LocalCluster::start(4, settings()).unwrap();
    let members = cluster.membership().nodes;
    let keys: Vec<Key> = (0..50)
        .map(|i| Key::new(&format!("key-{}", i), KeyKind::Blob))
        .chain((0..12).map(|i| Key::new("col", KeyKind::Column).chunk(i)))
        .collect();
    for key in &keys {
        let homes: Vec<usize> = cluster
            .nodes()
            .iter()
            .map(|n| n.kv.home_of(key).unwrap())
            .collect();
        assert!(homes.windows(2).all(|w| w[0] == w[1]), "{}", key);
        assert!(members.contains(&homes[0]));
    }
    for cidx in 0..12 {
        let key = Key::new("col", KeyKind::Column).chunk(cidx);
        let home = cluster.node(1).unwrap().kv.home_of(&key).unwrap();
        assert_eq!(home, members[cidx % members.len()]);
    }
}

#[tokio::test]
async fn test_remote_get_put_remove() {
    let cluster = LocalCluster::start(3, settings()).unwrap();
    let nodes = cluster.nodes();
    let key = (0..)
        .map(|i| Key::new(&format!("blob-{}", i), KeyKind::Blob))
        .find(|k| nodes[0].kv.home_of(k).unwrap() == 3)
        .unwrap();

    let missing = nodes[0].kv.get(&key).await;
    assert!(matches!(missing, Err(LiquidError::NotFound(_))));

    nodes[0]
        .kv
        .put(key.clone(), Value::Blob(Arc::new(vec![1, 2, 3])))
        .await
        .unwrap();
    assert!(nodes[2].kv.local_keys().contains(&key));
    assert!(!nodes[0].kv.local_keys().contains(&key));
    let got = nodes[1].kv.get(&key).await.unwrap().into_blob().unwrap();
    assert_eq!(*got, vec![1, 2, 3]);

    nodes[1].kv.remove(&key).await.unwrap();
    assert!(!nodes[2].kv.local_keys().contains(&key));
    // removing twice is fine
    nodes[1].kv.remove(&key).await.unwrap();
    nodes[0].kv.invalidate(&key);
    let gone = nodes[0].kv.get(&key).await;
    assert!(matches!(gone, Err(LiquidError::NotFound(_))));
}

#[tokio::test]
async fn test_column_at_and_set() {
    let cluster = LocalCluster::start(3, settings()).unwrap();
    let writer = cluster.node(1).unwrap();
    let values: Vec<Option<i64>> = (0..300).map(|i| Some(i % 100)).collect();
    let frame = FrameBuilder::new(100)
        .integers("x", values)
        .build(&writer.kv)
        .await
        .unwrap();
    let column = frame.column("x").unwrap();
    assert_eq!(column.at(&writer.kv, 150).await.unwrap(), Data::Int(50));
    assert!(matches!(
        column.at(&writer.kv, 300).await,
        Err(LiquidError::RowIndexOutOfBounds)
    ));

    // row 150 lives on node 2; a value that does not fit inflates the chunk
    let before = column.chunk_for_row(&writer.kv, 150).await.unwrap();
    assert_eq!(before.bits_per_value(), 8);
    column.set(&writer.kv, 150, Data::Int(100_000)).await.unwrap();
    column.set(&writer.kv, 151, Data::Null).await.unwrap();

    let reader = cluster.node(3).unwrap();
    let column = Column::fetch(&reader.kv, &column.key).await.unwrap();
    let after = column.chunk_for_row(&reader.kv, 150).await.unwrap();
    assert!(after.bits_per_value() > 8);
    assert_eq!(column.at(&reader.kv, 150).await.unwrap(), Data::Int(100_000));
    assert_eq!(column.at(&reader.kv, 151).await.unwrap(), Data::Null);
    assert_eq!(column.at(&reader.kv, 152).await.unwrap(), Data::Int(52));
    // the other chunks are untouched
    let first = column.chunk_for_chunk_idx(&reader.kv, 0).await.unwrap();
    assert_eq!(first.bits_per_value(), 8);
}

#[tokio::test]
async fn test_constant_and_sequence_columns() {
    let cluster = LocalCluster::start(3, settings()).unwrap();
    let writer = cluster.node(1).unwrap();
    let layout = Layout::from_chunk_lens(&[3, 0, 5]);
    let con = Column::make_con(&writer.kv, "con", layout.clone(), 2.5)
        .await
        .unwrap();
    let zero = con.make_zero(&writer.kv, "zero").await.unwrap();
    let seq = Column::make_seq(&writer.kv, "seq", layout.clone())
        .await
        .unwrap();

    let reader = cluster.node(3).unwrap();
    let con = Column::fetch(&reader.kv, &con.key).await.unwrap();
    let zero = Column::fetch(&reader.kv, &zero.key).await.unwrap();
    let seq = Column::fetch(&reader.kv, &seq.key).await.unwrap();
    assert_eq!(con.layout(), &layout);
    assert_eq!(zero.layout(), &layout);
    for cidx in 0..layout.n_chunks() {
        let c = con.chunk_for_chunk_idx(&reader.kv, cidx).await.unwrap();
        assert_eq!(c.codec(), Codec::Constant);
        assert_eq!(c.len(), layout.chunk_len(cidx).unwrap());
        let z = zero.chunk_for_chunk_idx(&reader.kv, cidx).await.unwrap();
        assert_eq!(z.codec(), Codec::Constant);
    }
    for row in 0..layout.n_rows() {
        assert_eq!(con.at(&reader.kv, row).await.unwrap(), Data::Float(2.5));
        assert_eq!(zero.at(&reader.kv, row).await.unwrap(), Data::Int(0));
        assert_eq!(
            seq.at(&reader.kv, row).await.unwrap(),
            Data::Int(row as i64 + 1)
        );
    }

    let missing = Column::make_con(&writer.kv, "missing", layout, f64::NAN)
        .await
        .unwrap();
    assert_eq!(missing.at(&reader.kv, 7).await.unwrap(), Data::Null);
}

#[tokio::test]
async fn test_categorical_and_string_columns() {
    let cluster = LocalCluster::start(2, settings()).unwrap();
    let node = cluster.node(1).unwrap();
    let domain = vec!["red".to_string(), "green".to_string(), "blue".to_string()];
    let codes = vec![Some(0), Some(2), None, Some(1)];
    let words = vec![Some("a".to_string()), None, Some("ccc".to_string()), Some("".to_string())];
    let frame = FrameBuilder::new(2)
        .categorical("color", domain.clone(), codes)
        .strings("word", words)
        .build(&node.kv)
        .await
        .unwrap();
    let color = frame.column("color").unwrap();
    assert_eq!(color.col_type(), ColumnType::Categorical);
    assert_eq!(color.domain(), Some(domain.as_slice()));
    assert_eq!(color.at(&node.kv, 1).await.unwrap(), Data::Cat(2));
    assert_eq!(color.at(&node.kv, 2).await.unwrap(), Data::Null);
    assert!(matches!(
        color.set(&node.kv, 0, Data::Cat(3)).await,
        Err(LiquidError::TypeMismatch)
    ));

    let word = frame.column("word").unwrap();
    assert_eq!(word.at(&node.kv, 2).await.unwrap(), Data::Str("ccc".to_string()));
    assert_eq!(word.at(&node.kv, 1).await.unwrap(), Data::Null);
    word.set(&node.kv, 1, Data::Str("filled".to_string())).await.unwrap();
    assert_eq!(word.at(&node.kv, 1).await.unwrap(), Data::Str("filled".to_string()));

    let bad = FrameBuilder::new(2)
        .categorical("c", domain, vec![Some(5)])
        .build(&node.kv)
        .await;
    assert!(matches!(bad, Err(LiquidError::TypeMismatch)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rollups_are_cached_until_written() {
    let cluster = LocalCluster::start(3, settings()).unwrap();
    let node = cluster.node(1).unwrap();
    let mut values: Vec<f64> = (1..=100).map(f64::from).collect();
    values[10] = f64::NAN;
    values[20] = f64::INFINITY;
    let frame = FrameBuilder::new(25)
        .numeric("x", values)
        .build(&node.kv)
        .await
        .unwrap();
    let column = frame.column("x").unwrap();
    let stats = column.rollups(node).await.unwrap();
    assert_eq!(stats.rows, 100);
    assert_eq!(stats.na, 1);
    assert_eq!(stats.pinf, 1);
    assert_eq!(stats.count(), 98);
    assert_eq!(stats.min, 1.0);
    assert_eq!(stats.max, 100.0);
    assert!(stats.is_int);
    let expected = ((1..=100).sum::<i32>() - 11 - 21) as f64 / 98.0;
    assert!((stats.mean - expected).abs() < 1e-9);

    // another node sees the cached statistics
    let other = cluster.node(2).unwrap();
    let cached = column.rollups(other).await.unwrap();
    assert_eq!(*cached, *stats);

    column.set(&node.kv, 0, Data::Float(-0.5)).await.unwrap();
    let stats = column.rollups(node).await.unwrap();
    assert_eq!(stats.min, -0.5);
    assert!(!stats.is_int);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_categorical_rollups_report_cardinality() {
    let cluster = LocalCluster::start(2, settings()).unwrap();
    let node = cluster.node(1).unwrap();
    let domain: Vec<String> = (0..5).map(|i| format!("level-{}", i)).collect();
    let codes = (0..40).map(|i| Some(i % 3)).collect();
    let frame = FrameBuilder::new(10)
        .categorical("c", domain, codes)
        .build(&node.kv)
        .await
        .unwrap();
    let stats = frame.column("c").unwrap().rollups(node).await.unwrap();
    assert_eq!(stats.cardinality, Some(5));
    assert_eq!(stats.rows, 40);
    assert_eq!(stats.max, 2.0);
}

#[tokio::test]
async fn test_frame_build_rejects_bad_input() {
    let cluster = LocalCluster::start(1, settings()).unwrap();
    let kv = &cluster.node(1).unwrap().kv;
    let ragged = FrameBuilder::new(10)
        .numeric("a", vec![1.0; 10])
        .numeric("b", vec![1.0; 11])
        .build(kv)
        .await;
    assert!(matches!(ragged, Err(LiquidError::IncompatiblePartitioning)));
    let twice = FrameBuilder::new(10)
        .numeric("a", vec![1.0; 10])
        .numeric("a", vec![1.0; 10])
        .build(kv)
        .await;
    assert!(matches!(twice, Err(LiquidError::NameAlreadyExists)));
    let layout = Layout::new(vec![0, 4, 9]).unwrap();
    let short = FrameBuilder::with_layout(layout)
        .numeric("a", vec![1.0; 10])
        .build(kv)
        .await;
    assert!(matches!(short, Err(LiquidError::IncompatiblePartitioning)));
}

#[tokio::test]
async fn test_frame_with_explicit_layout() {
    let cluster = LocalCluster::start(2, settings()).unwrap();
    let kv = &cluster.node(2).unwrap().kv;
    let layout = Layout::from_chunk_lens(&[3, 0, 5, 2]);
    let frame = FrameBuilder::with_layout(layout.clone())
        .numeric("a", (0..10).map(f64::from).collect())
        .build(kv)
        .await
        .unwrap();
    assert_eq!(frame.layout(), &layout);
    let column = frame.column("a").unwrap();
    let empty = column.chunk_for_chunk_idx(kv, 1).await.unwrap();
    assert!(empty.is_empty());
    assert_eq!(empty.start(), 3);
    let chunk = column.chunk_for_row(kv, 3).await.unwrap();
    assert_eq!(chunk.cidx(), 2);
    assert_eq!(chunk.start(), 3);
    assert_eq!(chunk.atd(4).unwrap(), 7.0);
    let last = column.chunk_for_row(kv, 8).await.unwrap();
    assert_eq!(last.cidx(), 3);
}

#[tokio::test]
async fn test_scope_removes_what_it_tracks() {
    let cluster = LocalCluster::start(3, settings()).unwrap();
    let node = cluster.node(1).unwrap();
    let temp = FrameBuilder::new(10)
        .numeric("temp", vec![1.0; 45])
        .build(&node.kv)
        .await
        .unwrap();
    let result = FrameBuilder::new(10)
        .numeric("result", vec![2.0; 45])
        .build(&node.kv)
        .await
        .unwrap();

    let mut scope = Scope::new();
    scope.track_frame(&temp);
    scope.track_frame(&result);
    scope.keep(result.key.clone());
    let removed = scope.exit(&node.kv).await.unwrap();
    assert!(removed >= 1 + 1 + 5);

    let leaked: Vec<Key> = cluster
        .nodes()
        .iter()
        .flat_map(|n| n.kv.local_keys())
        .filter(|k| temp.keys().contains(k))
        .collect();
    assert!(leaked.is_empty(), "leaked {:?}", leaked);

    let kept = Frame::fetch(&node.kv, &result.key).await.unwrap();
    let column = kept.column("result").unwrap();
    assert_eq!(column.at(&node.kv, 44).await.unwrap(), Data::Int(2));
}

#[tokio::test]
async fn test_deleted_frame_is_gone_everywhere() {
    let cluster = LocalCluster::start(3, settings()).unwrap();
    let node = cluster.node(3).unwrap();
    let frame = FrameBuilder::new(4)
        .numeric("x", vec![0.5; 30])
        .numeric("y", vec![1.5; 30])
        .build(&node.kv)
        .await
        .unwrap();
    let keys = frame.keys();
    frame.delete(&node.kv).await.unwrap();
    for n in cluster.nodes() {
        assert!(n.kv.local_keys().iter().all(|k| !keys.contains(k)));
    }
    assert!(matches!(
        Frame::fetch(&node.kv, &frame.key).await,
        Err(LiquidError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_spilled_chunks_reload() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings();
    settings.cache.spill_dir = Some(dir.path().to_path_buf());
    let cluster = LocalCluster::start(2, settings).unwrap();
    let node = cluster.node(1).unwrap();
    let frame = FrameBuilder::new(10)
        .numeric("x", (0..40).map(f64::from).collect())
        .build(&node.kv)
        .await
        .unwrap();
    let column = frame.column("x").unwrap();
    for n in cluster.nodes() {
        for key in n.kv.local_keys() {
            if key.kind == KeyKind::Chunk {
                n.kv.spill(&key).unwrap();
            }
        }
    }
    let stats = column.rollups(node).await.unwrap();
    assert_eq!(stats.rows, 40);
    assert_eq!(stats.max, 39.0);
    assert_eq!(column.at(&node.kv, 25).await.unwrap(), Data::Int(25));
}
