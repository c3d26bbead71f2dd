// Pure reducers applying decoded stream events to session state.

pub mod documents;
pub mod transcript;
