/// Where a terminal's output goes and where its geometry comes from.
///
/// Called from the driver task; implementations should not block.
pub trait RenderTarget: Send + Sync + 'static {
    /// Current visible `(cols, rows)`.
    fn geometry(&self) -> (u16, u16);

    /// Apply raw terminal output.
    fn write(&self, data: &[u8]);

    /// Scroll to bottom and repaint.
    fn refresh(&self);
}
