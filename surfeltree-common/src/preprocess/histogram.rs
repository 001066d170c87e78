/// Number of bins for choosing split values out of core.
pub const HISTOGRAM_BINS: usize = 4096;

/// Histogram over one coordinate axis, used to find count quantiles with a single
/// sequential pass over data that does not fit into memory.
#[derive(Debug, Clone)]
pub struct AxisHistogram {
    min: f64,
    max: f64,
    bins: Vec<u64>,
}

/// Split of the histogram range into parts at bin boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quantiles {
    /// First bin of every part except the first one. Ascending.
    pub split_bins: Vec<usize>,

    /// Exact number of values in each part.
    pub counts: Vec<u64>,
}

impl AxisHistogram {
    pub fn new(min: f64, max: f64, bins: usize) -> Self {
        AxisHistogram {
            min,
            max,
            bins: vec![0; bins.max(1)],
        }
    }

    pub fn bin(&self, value: f64) -> usize {
        let width = self.max - self.min;
        if width <= 0.0 || value.is_nan() {
            return 0;
        }
        let bin = ((value - self.min) / width * self.bins.len() as f64).floor();
        bin.clamp(0.0, (self.bins.len() - 1) as f64) as usize
    }

    /// Lower boundary of the given bin.
    pub fn edge(&self, bin: usize) -> f64 {
        self.min + (self.max - self.min) * bin as f64 / self.bins.len() as f64
    }

    pub fn add(&mut self, value: f64) {
        let bin = self.bin(value);
        self.bins[bin] += 1;
    }

    pub fn total(&self) -> u64 {
        self.bins.iter().sum()
    }

    /// Chooses bin boundaries that split the values into `parts` parts with about the
    /// same number of values each.
    pub fn quantiles(&self, parts: usize) -> Quantiles {
        let parts = parts.max(1);
        let total = self.total();
        let mut split_bins = Vec::with_capacity(parts - 1);
        let mut counts = vec![0_u64; parts];
        let mut part = 0;
        let mut seen = 0_u64;
        for (bin, &count) in self.bins.iter().enumerate() {
            // close the current part at this bin boundary, once it holds its share
            while part + 1 < parts && seen > 0 && seen >= total * (part as u64 + 1) / parts as u64
            {
                split_bins.push(bin);
                part += 1;
            }
            counts[part] += count;
            seen += count;
        }
        while split_bins.len() + 1 < parts {
            split_bins.push(self.bins.len());
        }
        Quantiles { split_bins, counts }
    }

    /// The part of the given quantiles that a value belongs to.
    pub fn part_of(&self, quantiles: &Quantiles, value: f64) -> usize {
        let bin = self.bin(value);
        quantiles.split_bins.partition_point(|&s| s <= bin)
    }
}
