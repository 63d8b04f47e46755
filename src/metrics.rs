use std::sync::LazyLock;

use prometheus::*;

static METRIC_CAPTION_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "photo_search_caption_count",
        "count of the captioned images",
        &["result"]
    )
    .unwrap()
});

static METRIC_STORED_COUNT: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("photo_search_stored_count", "count of the stored photo records")
        .unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "photo_search_search_duration",
        "duration of the per-query search in seconds"
    )
    .unwrap()
});

static METRIC_SEARCH_MAX_SCORE: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "photo_search_search_max_score",
        "max similarity of the per-query search",
        (0..=20).map(|x| x as f64 / 20.).collect()
    )
    .unwrap()
});

pub fn inc_caption_generated() {
    METRIC_CAPTION_COUNT.with_label_values(&["generated"]).inc();
}

/// 描述生成失败、使用占位描述的次数
pub fn inc_caption_fallback() {
    METRIC_CAPTION_COUNT.with_label_values(&["fallback"]).inc();
}

pub fn inc_stored(count: usize) {
    METRIC_STORED_COUNT.inc_by(count as u64);
}

pub fn observe_search(duration: f32, max_score: Option<f64>) {
    METRIC_SEARCH_DURATION.observe(duration as f64);
    if let Some(score) = max_score {
        METRIC_SEARCH_MAX_SCORE.observe(score);
    }
}
