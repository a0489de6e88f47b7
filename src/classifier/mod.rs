pub mod classifier;
pub mod features;

pub use classifier::{
    load_label_vector,
    spawn_classifier,
    ClassificationOutcome,
    ClassificationRequest,
    Classifier,
    ClassifierHandles,
    OnnxClassifier,
};
pub use features::FeatureSelection;
