use std::fmt::Display;

use serde::Serialize;

use crate::cli::OutputFormat;

const COLUMN_GAP: usize = 3;

#[derive(Serialize)]
pub struct TableCellOption<T>(Option<T>);

impl<T> From<Option<T>> for TableCellOption<T> {
    fn from(value: Option<T>) -> Self {
        TableCellOption(value)
    }
}

impl<T: Display> Display for TableCellOption<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(value) => value.fmt(f),
            None => f.write_str("-"),
        }
    }
}

#[derive(Serialize)]
pub struct TableCellSlice<'a, T>(&'a [T]);

impl<'a, T> From<&'a [T]> for TableCellSlice<'a, T> {
    fn from(value: &'a [T]) -> Self {
        TableCellSlice(value)
    }
}

impl<'a, T: Display> Display for TableCellSlice<'a, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("-");
        }

        for (index, value) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }

            value.fmt(f)?;
        }

        Ok(())
    }
}

/// Implemented through `#[derive(TableOutputRow)]`.
pub trait TableOutputRow {
    fn get_name(&self) -> String;
    fn get_column_names() -> Vec<&'static str>;
    fn get_row(&self) -> Vec<String>;
}

pub trait TableOutputDisplay {
    fn render_names(self) -> String;
    fn render_table(self, with_headers: bool) -> String;
}

impl<I: IntoIterator<Item = T>, T: TableOutputRow> TableOutputDisplay for I {
    fn render_names(self) -> String {
        self.into_iter()
            .map(|row| format!("{}\n", row.get_name()))
            .collect()
    }

    fn render_table(self, with_headers: bool) -> String {
        let mut rows: Vec<Vec<String>> = Vec::new();

        if with_headers {
            rows.push(
                T::get_column_names()
                    .into_iter()
                    .map(str::to_owned)
                    .collect(),
            );
        }

        rows.extend(self.into_iter().map(|row| row.get_row()));

        let mut widths = vec![0; T::get_column_names().len()];

        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        rows.iter()
            .map(|row| {
                let line = row
                    .iter()
                    .zip(&widths)
                    .map(|(cell, width)| format!("{:<width$}", cell, width = width + COLUMN_GAP))
                    .collect::<String>();

                format!("{}\n", line.trim_end())
            })
            .collect()
    }
}

pub trait SerializableOutputDisplay {
    fn print_json(&self) -> Result<(), serde_json::Error>;
    fn print_json_pretty(&self) -> Result<(), serde_json::Error>;
    fn print_yaml(&self) -> Result<(), serde_yaml::Error>;
}

impl<T: ?Sized + Serialize> SerializableOutputDisplay for T {
    fn print_json(&self) -> Result<(), serde_json::Error> {
        let output = serde_json::to_string(self)?;
        println!("{output}");

        Ok(())
    }

    fn print_json_pretty(&self) -> Result<(), serde_json::Error> {
        let output = serde_json::to_string_pretty(self)?;
        println!("{output}");

        Ok(())
    }

    fn print_yaml(&self) -> Result<(), serde_yaml::Error> {
        let output = serde_yaml::to_string(self)?;
        print!("{output}");

        Ok(())
    }
}

pub trait CliPrint {
    fn print(self, format: OutputFormat) -> anyhow::Result<()>;
}

impl<T: Serialize + TableOutputDisplay> CliPrint for T {
    fn print(self, format: OutputFormat) -> anyhow::Result<()> {
        match format {
            OutputFormat::Names => print!("{}", self.render_names()),
            OutputFormat::Table => print!("{}", self.render_table(false)),
            OutputFormat::TableWithHeaders => print!("{}", self.render_table(true)),
            OutputFormat::Json => self.print_json()?,
            OutputFormat::JsonPretty => self.print_json_pretty()?,
            OutputFormat::Yaml => self.print_yaml()?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vpn_fleet_macros::TableOutputRow;

    use super::{TableCellOption, TableCellSlice, TableOutputDisplay};

    #[derive(TableOutputRow)]
    struct Row<'a> {
        #[name_column]
        name: &'a str,
        public_address: TableCellOption<&'a str>,
        routes: TableCellSlice<'a, &'a str>,
    }

    fn rows<'a>(routes: &'a [&'a str]) -> Vec<Row<'a>> {
        vec![
            Row {
                name: "alice",
                public_address: Some("10.0.0.3").into(),
                routes: routes.into(),
            },
            Row {
                name: "bob",
                public_address: None.into(),
                routes: (&[][..]).into(),
            },
        ]
    }

    #[test]
    fn table_columns_are_aligned() {
        let routes = ["0.0.0.0/0", "10.1.0.0/16"];

        assert_eq!(
            rows(&routes).render_table(true),
            "NAME    PUBLIC ADDRESS   ROUTES\n\
             alice   10.0.0.3         0.0.0.0/0,10.1.0.0/16\n\
             bob     -                -\n"
        );
    }

    #[test]
    fn names_are_listed_one_per_line() {
        assert_eq!(rows(&[]).render_names(), "alice\nbob\n");
    }
}
