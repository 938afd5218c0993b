/// Index of the bias feature.
pub const CONSTANT: u64 = 11650396;
/// Namespace id holding the bias feature.
pub const CONSTANT_NAMESPACE: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feature {
    pub index: u64,
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Namespace {
    pub id: u8,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// `None` marks a test example: predicted, never learned from.
    pub label: Option<f32>,
    /// Importance weight.
    pub weight: f32,
    /// Base prediction added before the dot product.
    pub initial: f32,
    pub tag: Option<String>,
    /// Pass over the data this example belongs to.
    pub pass: usize,
    pub namespaces: Vec<Namespace>,
    pub final_prediction: f32,
    pub loss: f32,
}

impl Default for Example {
    fn default() -> Self {
        Self {
            label: None,
            weight: 1.0,
            initial: 0.0,
            tag: None,
            pass: 0,
            namespaces: Vec::new(),
            final_prediction: 0.0,
            loss: 0.0,
        }
    }
}

impl Example {
    pub fn new(label: Option<f32>) -> Self {
        Self {
            label,
            ..Default::default()
        }
    }

    /// Appends a feature to namespace `id`, creating the namespace on first use.
    pub fn push_feature(&mut self, id: u8, index: u64, value: f32) {
        let feature = Feature { index, value };
        match self.namespaces.iter_mut().find(|ns| ns.id == id) {
            Some(ns) => ns.features.push(feature),
            None => self.namespaces.push(Namespace {
                id,
                features: vec![feature],
            }),
        }
    }

    pub fn add_constant(&mut self) {
        self.push_feature(CONSTANT_NAMESPACE, CONSTANT, 1.0);
    }

    pub fn namespace(&self, id: u8) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.id == id)
    }

    pub fn num_features(&self) -> usize {
        self.namespaces.iter().map(|ns| ns.features.len()).sum()
    }

    pub fn is_test(&self) -> bool {
        self.label.is_none()
    }
}
