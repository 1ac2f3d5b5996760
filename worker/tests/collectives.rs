mod common;

use futures::future;
use ndarray::{Array3, array};
use worker::{
    WorkerErr,
    dist::CollectiveChannel,
    metrics::{MetricAggregator, ReducedCounts},
};

use common::star;

async fn reduce_counts(preds: Vec<Array3<u8>>, targets: Vec<Array3<u8>>) -> Vec<ReducedCounts> {
    let mut channels = star(preds.len()).await;

    let runs = channels
        .iter_mut()
        .zip(preds.into_iter().zip(targets))
        .map(|(channel, (pred, target))| async move {
            let mut aggregator = MetricAggregator::new(2, 255);
            aggregator.add_batch(pred.view(), target.view())?;
            aggregator.reduce(channel).await
        });

    future::try_join_all(runs).await.unwrap()
}

#[tokio::test]
async fn three_ranks_agree_on_the_sum() {
    let mut channels = star(3).await;

    let runs = channels.iter_mut().enumerate().map(|(rank, channel)| async move {
        let mut grad = vec![rank as f32, 1.0, -0.5];
        let mut counts = vec![rank as u64 + 1];

        channel.all_reduce_sum(&mut grad).await?;
        channel.barrier().await?;
        channel.all_reduce_sum(&mut counts).await?;
        channel.barrier().await?;

        Ok::<_, WorkerErr>((channel.rank(), grad, counts))
    });

    let results = future::try_join_all(runs).await.unwrap();

    for (rank, (theirs, grad, counts)) in results.into_iter().enumerate() {
        assert_eq!(theirs, rank);
        assert_eq!(grad, vec![3.0, 3.0, -1.5]);
        assert_eq!(counts, vec![6]);
    }
}

#[tokio::test]
async fn every_rank_leaves_cleanly() {
    let mut channels = star(3).await;

    let runs = channels.iter_mut().map(|channel| channel.shutdown());
    future::try_join_all(runs).await.unwrap();
}

#[tokio::test]
async fn barrier_against_a_reduction_is_a_protocol_error() {
    let mut channels = star(2).await;
    let (hub, spoke) = channels.split_at_mut(1);

    let mut buf = [1.0_f32];
    let (hub, _) = tokio::join!(hub[0].barrier(), async {
        // The spoke is left waiting for an answer that never comes.
        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            spoke[0].all_reduce_sum(&mut buf),
        )
        .await;
    });

    assert!(matches!(hub, Err(WorkerErr::Protocol(_))));
}

#[tokio::test]
async fn two_workers_count_the_same_scene() {
    let pred = array![[[0_u8, 1], [1, 255]]];
    let target = array![[[0_u8, 1], [0, 0]]];

    let reduced = reduce_counts(vec![pred.clone(), pred], vec![target.clone(), target]).await;

    for counts in &reduced {
        assert_eq!(counts.counts().intersection, vec![2, 2]);
        assert_eq!(counts.counts().union, vec![6, 4]);
        assert_eq!(counts.counts().target, vec![6, 2]);

        let iou = counts.iou_class();
        assert!((iou[0] - 100.0 / 3.0).abs() < 1e-6);
        assert!((iou[1] - 50.0).abs() < 1e-6);
        assert!((counts.overall_acc() - 50.0).abs() < 1e-6);
    }

    assert_eq!(reduced[0], reduced[1]);
}

#[tokio::test]
async fn reduced_iou_is_not_the_mean_of_local_ious() {
    // Local changed IoUs are 4/4 and 1/8.
    let perfect = Array3::from_elem((1, 2, 2), 1_u8);
    let mut sparse = Array3::zeros((1, 2, 4));
    sparse[[0, 0, 0]] = 1;
    let changed = Array3::from_elem((1, 2, 4), 1_u8);

    let reduced = reduce_counts(vec![perfect.clone(), sparse], vec![perfect, changed]).await;

    let global = reduced[0].iou_class()[1];
    let local_mean = (100.0 + 12.5) / 2.0;

    assert!((global - 5.0 / 12.0 * 100.0).abs() < 1e-6);
    assert!((global - local_mean).abs() > 1.0);
    assert!(reduced[0].iou_class().iter().all(|iou| (0.0..=100.0).contains(iou)));
}

#[tokio::test]
async fn replicas_share_parameters_and_gradients() {
    use machine_learning::arch::{BackboneSize, ChangeDetector, SiameseNet};
    use ndarray::Array;
    use worker::model::ReplicatedModel;

    let mut channels = star(2).await;

    let runs = channels.iter_mut().enumerate().map(|(rank, channel)| async move {
        // Different seeds, rank 0's parameters must win.
        let model = SiameseNet::new(3, BackboneSize::Small, 2, rank as u64).unwrap();
        let mut replica = ReplicatedModel::new(model, channel).await?;

        let x = Array::from_elem((1, 3, 2, 2), rank as f32 + 0.5);
        let scores = replica.forward(x.view(), x.view())?;
        let d = Array::from_elem(scores.raw_dim(), 1.0_f32);
        replica.backward(d.view(), channel).await?;

        let params = replica.inner().params();
        let grads: Vec<Vec<f32>> = params.iter().map(|group| group.grad().to_vec()).collect();
        Ok::<_, WorkerErr>((params.snapshot(), grads))
    });

    let results = future::try_join_all(runs).await.unwrap();
    let seeded = SiameseNet::new(3, BackboneSize::Small, 2, 0).unwrap();

    assert_eq!(results[0].0, results[1].0);
    assert_eq!(results[0].0, seeded.params().snapshot());
    assert_eq!(results[0].1, results[1].1);
}
