use std::io::IsTerminal;

use comfy_table::{presets::NOTHING, Attribute, Cell, CellAlignment, Table};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TableTheme {
    pub use_color: bool,
}

impl TableTheme {
    pub(crate) fn detect() -> Self {
        let is_tty = std::io::stdout().is_terminal();
        let no_color = std::env::var_os("NO_COLOR").is_some();
        resolve_table_theme(is_tty, no_color)
    }

    pub(crate) fn new_data_table(self, headers: &[&str]) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        let header_cells: Vec<Cell> = headers.iter().map(|h| self.bold(h)).collect();
        table.set_header(header_cells);
        table
    }

    pub(crate) fn new_kv_table(self) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table
    }

    fn bold(self, text: &str) -> Cell {
        let cell = Cell::new(text);
        if self.use_color {
            cell.add_attribute(Attribute::Bold)
        } else {
            cell
        }
    }
}

fn resolve_table_theme(is_tty: bool, no_color: bool) -> TableTheme {
    TableTheme {
        use_color: is_tty && !no_color,
    }
}

/// Right-aligned cell for counts and sizes.
pub(crate) fn num_cell(value: impl ToString) -> Cell {
    Cell::new(value.to_string()).set_alignment(CellAlignment::Right)
}

pub(crate) fn add_kv_row(table: &mut Table, theme: TableTheme, field: &str, value: impl ToString) {
    table.add_row(vec![theme.bold(field), Cell::new(value.to_string())]);
}

#[cfg(test)]
mod tests {
    use comfy_table::presets::NOTHING;

    use super::*;

    #[test]
    fn color_needs_a_tty() {
        assert!(resolve_table_theme(true, false).use_color);
        assert!(!resolve_table_theme(false, false).use_color);
    }

    #[test]
    fn no_color_disables_color() {
        assert!(!resolve_table_theme(true, true).use_color);
    }

    #[test]
    fn tables_use_nothing_preset() {
        let theme = resolve_table_theme(false, false);
        let mut data = theme.new_data_table(&["Date", "Changes"]);
        assert_eq!(data.current_style_as_preset(), NOTHING);

        let mut kv = theme.new_kv_table();
        add_kv_row(&mut kv, theme, "Snapshots", 3);
        assert_eq!(kv.current_style_as_preset(), NOTHING);
        assert!(kv.to_string().contains("Snapshots"));
    }
}
