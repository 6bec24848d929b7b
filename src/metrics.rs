//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, Gauge, MetricBuilder};

/// `Manager`のメトリクス.
#[derive(Debug, Clone)]
pub struct ManagerMetrics {
    pub(crate) allocations: Counter,
    pub(crate) deallocations: Counter,
    pub(crate) flushes: Counter,
    pub(crate) segment_allocator: SegmentAllocatorMetrics,
    pub(crate) bin: BinMetrics,
    pub(crate) object_directory: ObjectDirectoryMetrics,
}
impl ManagerMetrics {
    /// `allocate`系の呼び出しが成功した回数.
    ///
    /// `construct`系の操作による割当も含まれる.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_manager_allocations_total <COUNTER>
    /// ```
    pub fn allocations(&self) -> u64 {
        self.allocations.value() as u64
    }

    /// `deallocate`の呼び出しが成功した回数.
    ///
    /// `destroy`による解放も含まれる.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_manager_deallocations_total <COUNTER>
    /// ```
    pub fn deallocations(&self) -> u64 {
        self.deallocations.value() as u64
    }

    /// `flush`の呼び出し回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_manager_flushes_total <COUNTER>
    /// ```
    pub fn flushes(&self) -> u64 {
        self.flushes.value() as u64
    }

    /// セグメントアロケータのメトリクス.
    pub fn segment_allocator(&self) -> &SegmentAllocatorMetrics {
        &self.segment_allocator
    }

    /// 小オブジェクト用ビンのメトリクス.
    pub fn bin(&self) -> &BinMetrics {
        &self.bin
    }

    /// オブジェクトディレクトリのメトリクス.
    pub fn object_directory(&self) -> &ObjectDirectoryMetrics {
        &self.object_directory
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("permheap").subsystem("manager");
        ManagerMetrics {
            allocations: builder
                .counter("allocations_total")
                .help("Number of successful allocations")
                .finish()
                .expect("Never fails"),
            deallocations: builder
                .counter("deallocations_total")
                .help("Number of successful deallocations")
                .finish()
                .expect("Never fails"),
            flushes: builder
                .counter("flushes_total")
                .help("Number of flush operations")
                .finish()
                .expect("Never fails"),
            segment_allocator: SegmentAllocatorMetrics::new(&builder),
            bin: BinMetrics::new(&builder),
            object_directory: ObjectDirectoryMetrics::new(&builder),
        }
    }
}

/// チャンク単位の割当を行うセグメントアロケータのメトリクス.
#[derive(Debug, Clone)]
pub struct SegmentAllocatorMetrics {
    pub(crate) acquired_chunks: Counter,
    pub(crate) released_chunks: Counter,
    pub(crate) segment_size_bytes: Gauge,
    pub(crate) growths: Counter,
    pub(crate) nospace_failures: Counter,
}
impl SegmentAllocatorMetrics {
    /// これまでに確保されたチャンクの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_segment_allocator_acquired_chunks_total <COUNTER>
    /// ```
    pub fn acquired_chunks(&self) -> u64 {
        self.acquired_chunks.value() as u64
    }

    /// これまでに解放されたチャンクの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_segment_allocator_released_chunks_total <COUNTER>
    /// ```
    pub fn released_chunks(&self) -> u64 {
        self.released_chunks.value() as u64
    }

    /// このセッションで使用中になっているチャンクの増分.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_segment_allocator_acquired_chunks_total - permheap_segment_allocator_released_chunks_total
    /// ```
    pub fn usage_chunks(&self) -> i64 {
        // NOTE: 以下の順番で値を取得しないと、本来よりも大きな値が見えてしまう可能性がある
        let dec = self.released_chunks();
        let inc = self.acquired_chunks();
        inc as i64 - dec as i64
    }

    /// セグメント(バッキングファイル群)の現在のサイズ.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_segment_allocator_segment_size_bytes <GAUGE>
    /// ```
    pub fn segment_size_bytes(&self) -> u64 {
        self.segment_size_bytes.value() as u64
    }

    /// セグメントが拡張された回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_segment_allocator_growths_total <COUNTER>
    /// ```
    pub fn growths(&self) -> u64 {
        self.growths.value() as u64
    }

    /// 空き領域不足によって割当に失敗した回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_segment_allocator_nospace_failures_total <COUNTER>
    /// ```
    pub fn nospace_failures(&self) -> u64 {
        self.nospace_failures.value() as u64
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("permheap").subsystem("segment_allocator");
        SegmentAllocatorMetrics {
            acquired_chunks: builder
                .counter("acquired_chunks_total")
                .help("Number of acquired chunks")
                .finish()
                .expect("Never fails"),
            released_chunks: builder
                .counter("released_chunks_total")
                .help("Number of released chunks")
                .finish()
                .expect("Never fails"),
            segment_size_bytes: builder
                .gauge("segment_size_bytes")
                .help("Size of the backing segment")
                .finish()
                .expect("Never fails"),
            growths: builder
                .counter("growths_total")
                .help("Number of segment extensions")
                .finish()
                .expect("Never fails"),
            nospace_failures: builder
                .counter("nospace_failures_total")
                .help("Number of allocation failures caused by out-of-space")
                .finish()
                .expect("Never fails"),
        }
    }
}

/// 小オブジェクト用ビンのメトリクス.
#[derive(Debug, Clone)]
pub struct BinMetrics {
    pub(crate) allocated_slots: Counter,
    pub(crate) released_slots: Counter,
    pub(crate) cache_hits: Counter,
}
impl BinMetrics {
    /// スロットの割当回数.
    ///
    /// オブジェクトキャッシュから取り出された分も含む.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_bin_allocated_slots_total <COUNTER>
    /// ```
    pub fn allocated_slots(&self) -> u64 {
        self.allocated_slots.value() as u64
    }

    /// スロットの解放回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_bin_released_slots_total <COUNTER>
    /// ```
    pub fn released_slots(&self) -> u64 {
        self.released_slots.value() as u64
    }

    /// オブジェクトキャッシュから割当が行われた回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_bin_cache_hits_total <COUNTER>
    /// ```
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.value() as u64
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("permheap").subsystem("bin");
        BinMetrics {
            allocated_slots: builder
                .counter("allocated_slots_total")
                .help("Number of allocated small-object slots")
                .finish()
                .expect("Never fails"),
            released_slots: builder
                .counter("released_slots_total")
                .help("Number of released small-object slots")
                .finish()
                .expect("Never fails"),
            cache_hits: builder
                .counter("cache_hits_total")
                .help("Number of allocations served from the object cache")
                .finish()
                .expect("Never fails"),
        }
    }
}

/// オブジェクトディレクトリのメトリクス.
#[derive(Debug, Clone)]
pub struct ObjectDirectoryMetrics {
    pub(crate) constructed_objects: Counter,
    pub(crate) destroyed_objects: Counter,
    pub(crate) key_conflicts: Counter,
}
impl ObjectDirectoryMetrics {
    /// 構築されたオブジェクトの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_object_directory_constructed_objects_total <COUNTER>
    /// ```
    pub fn constructed_objects(&self) -> u64 {
        self.constructed_objects.value() as u64
    }

    /// 破棄されたオブジェクトの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_object_directory_destroyed_objects_total <COUNTER>
    /// ```
    pub fn destroyed_objects(&self) -> u64 {
        self.destroyed_objects.value() as u64
    }

    /// キーの重複によって構築に失敗した回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// permheap_object_directory_key_conflicts_total <COUNTER>
    /// ```
    pub fn key_conflicts(&self) -> u64 {
        self.key_conflicts.value() as u64
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("permheap").subsystem("object_directory");
        ObjectDirectoryMetrics {
            constructed_objects: builder
                .counter("constructed_objects_total")
                .help("Number of constructed objects")
                .finish()
                .expect("Never fails"),
            destroyed_objects: builder
                .counter("destroyed_objects_total")
                .help("Number of destroyed objects")
                .finish()
                .expect("Never fails"),
            key_conflicts: builder
                .counter("key_conflicts_total")
                .help("Number of construct failures caused by duplicate keys")
                .finish()
                .expect("Never fails"),
        }
    }
}
