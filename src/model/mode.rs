/// Whether a forward pass is part of training or evaluation.
///
/// Dropout is only active in [`Mode::Train`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Train,
    #[default]
    Eval,
}

impl Mode {
    #[must_use]
    pub fn is_train(self) -> bool {
        matches!(self, Self::Train)
    }
}
